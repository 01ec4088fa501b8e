use std::path::PathBuf;

use libcni::skel::*;

use anyhow::Result; // bail may be used.
use clap::{App, Arg};
use tracing::error;

mod bridge;
mod config;
mod error;
mod gateway;
mod ipam;
mod ipmasq;
mod ipsec;
mod logging;
mod netlink;
mod netns;
mod plugin;
mod sysctl;
mod veth;

use crate::error::PluginError;
use crate::ipam::ExecDelegate;

// `swan-bridge --render-ipsec-conf` prints the config ADD would write
fn render_ipsec_conf(netns: &str, template: Option<&String>) -> Result<()> {
    let id = ipsec::extract_proc_id(netns)?;
    let template = ipsec::load_template(template.map(PathBuf::from).as_deref())?;
    print!("{}", ipsec::render_config(&template, &id));
    Ok(())
}

async fn run(command: &str, cmd_args: &CmdArgs) -> Result<Option<String>, PluginError> {
    match command {
        "ADD" => {
            let delegate = ExecDelegate::new(&cmd_args.path);
            Ok(Some(plugin::cmd_add(cmd_args, &delegate).await?))
        }
        "DEL" => {
            let delegate = ExecDelegate::new(&cmd_args.path);
            plugin::cmd_del(cmd_args, &delegate).await?;
            Ok(None)
        }
        "VERSION" => Ok(Some(get_version_output())),
        c => Err(PluginError::MissingArgs(format!("unknown CNI_COMMAND: {}", c))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let render_arg: Arg = Arg::new("render-ipsec-conf")
        .help("print the ipsec.conf ADD would write for this netns path")
        .long("render-ipsec-conf")
        .value_name("NETNS_PATH")
        .takes_value(true)
        .required(false);
    let template_arg: Arg = Arg::new("template")
        .help("ipsec.conf template, the built-in one when omitted")
        .long("template")
        .value_name("FILE")
        .takes_value(true)
        .requires("render-ipsec-conf")
        .required(false);

    let app: App = App::new("swan-bridge")
        .version("0.1.0")
        .about("bridge CNI plugin with per-container IPsec tunnel")
        .arg(render_arg)
        .arg(template_arg);

    // operator mode, just quit before CNI plugin code
    let matches = app.try_get_matches()?;
    if let Some(netns) = matches.get_one::<String>("render-ipsec-conf") {
        return render_ipsec_conf(netns, matches.get_one::<String>("template"));
    }

    let (command, cmd_args) = match get_cmdargs() {
        Ok(v) => v,
        Err(e) => {
            let err = PluginError::from(e);
            println!("{}", serde_json::to_string(&err.to_cni_error(""))?);
            std::process::exit(1);
        }
    };
    logging::init(&cmd_args.stdin_data);

    match run(command.as_str(), &cmd_args).await {
        Ok(Some(output)) => println!("{}", output),
        Ok(None) => {}
        Err(err) => {
            error!(command = %command, container = %cmd_args.container_id, "{}", err);
            // report in the caller's version when the config is at least readable
            let cni_version = get_netconf(&cmd_args.stdin_data)
                .map(|n| n.cni_version)
                .unwrap_or_default();
            println!("{}", serde_json::to_string(&err.to_cni_error(&cni_version))?);
            std::process::exit(1);
        }
    }
    Ok(())
}
