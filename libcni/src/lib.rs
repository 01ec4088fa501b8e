// libcni: CNI invocation skeleton and versioned result types
// 2022, Tomofumi Hayashi
pub mod ipnet;
pub mod skel;

pub mod types {
    pub mod types_020;
    pub mod types_040;
    pub mod types_100;
    pub mod types_common;
}
