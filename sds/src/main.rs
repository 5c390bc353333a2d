use std::process::exit;

use clap::{crate_authors, crate_version, App as ClapApp, AppSettings, Arg, ArgMatches};
use env_logger::Env;

use sds::connector::DEFAULT_PORT;
use sds::{DeviceModel, Scope, ScopeConfig, Waveforms};

fn main() {
    let default_port = DEFAULT_PORT.to_string();
    let matches = ClapApp::new("Siglent SDS oscilloscope client")
        .author(crate_authors!())
        .version(crate_version!())
        .about("Remote control and waveform retrieval over the SCPI socket")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::new("host")
                .long("host")
                .short('H')
                .takes_value(true)
                .required(true)
                .help("Host name or IP address of the oscilloscope."),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .takes_value(true)
                .default_value(&default_port)
                .help("SCPI socket port."),
        )
        .arg(
            Arg::new("model")
                .long("model")
                .short('m')
                .takes_value(true)
                .help("Device model, e.g. \"SDS800X HD\"."),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .help("JSON configuration file."),
        )
        .arg(Arg::new("verbose").long("verbose").short('v').help("Log verbose output"))
        .subcommand(
            ClapApp::new("query")
                .about("Send a query and print the reply")
                .arg(Arg::new("cmd").required(true)),
        )
        .subcommand(
            ClapApp::new("command")
                .about("Send a command without reply")
                .arg(Arg::new("cmd").required(true)),
        )
        .subcommand(ClapApp::new("preamble").about("Print the waveform parameters as JSON"))
        .subcommand(
            ClapApp::new("acquire")
                .about("Acquire complete waveforms")
                .arg(Arg::new("channels").default_value("C1").help("Channels, e.g. \"C1,C2\"."))
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .takes_value(true)
                        .help("Write the waveforms as JSON to this file."),
                ),
        )
        .subcommand(
            ClapApp::new("screenshot")
                .about("Save a screenshot of the display")
                .arg(Arg::new("file").default_value("sds_screenshot.png")),
        )
        .get_matches();

    let verbose = matches.is_present("verbose");
    if verbose {
        env_logger::Builder::from_env(Env::default().default_filter_or("sds=debug")).init();
    } else {
        env_logger::init();
    }

    let mut config = match matches.value_of("config") {
        Some(path) => match ScopeConfig::load(path) {
            Ok(x) => x,
            Err(err) => {
                println!("Cannot load configuration `{}`: {}", path, err);
                exit(1);
            }
        },
        None => ScopeConfig::default(),
    };
    if let Some(model) = matches.value_of("model") {
        config.model = match DeviceModel::lookup(model) {
            Some(x) => x,
            None => {
                let names: Vec<_> = DeviceModel::names().collect();
                println!("Unknown model `{}`, expected one of: {}", model, names.join(", "));
                exit(1);
            }
        };
    }

    let port = matches.value_of("port").unwrap_or_default();
    let port = match port.parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            println!("Cannot parse `{}` as a port number.", port);
            exit(1);
        }
    };
    let host = matches.value_of("host").unwrap_or_default();

    let scope = match Scope::connect(&format!("{}:{}", host, port), config) {
        Ok(x) => x,
        Err(err) => {
            println!("Cannot connect to {}: {}", host, err);
            exit(1);
        }
    };

    let result = match matches.subcommand() {
        Some(("query", m)) => query(&scope, m),
        Some(("command", m)) => scope.command(m.value_of("cmd").unwrap_or_default()),
        Some(("preamble", _)) => preamble(&scope),
        Some(("acquire", m)) => acquire(&scope, m),
        Some(("screenshot", m)) => screenshot(&scope, m),
        _ => Ok(()),
    };
    scope.close();
    if let Err(err) = result {
        println!("{}", err);
        exit(1);
    }
}

fn query(scope: &Scope, matches: &ArgMatches) -> sds::Result<()> {
    match scope.query(matches.value_of("cmd").unwrap_or_default())? {
        Some(value) => println!("{}", value),
        None => println!("(empty reply)"),
    }
    Ok(())
}

fn preamble(scope: &Scope) -> sds::Result<()> {
    let wfp = scope.update_waveform_parameters()?;
    let text = serde_json::to_string_pretty(&wfp).map_err(sds::Error::interpretation)?;
    println!("{}", text);
    Ok(())
}

fn acquire(scope: &Scope, matches: &ArgMatches) -> sds::Result<()> {
    let channels = matches.value_of("channels").unwrap_or_default();
    let waveforms = match scope.get_waveforms(channels)? {
        Some(x) => x,
        None => {
            println!("No new acquisition available.");
            return Ok(());
        }
    };
    print_summary(&waveforms);
    if let Some(path) = matches.value_of("output") {
        let file = std::fs::File::create(path).map_err(sds::Error::transport)?;
        serde_json::to_writer(file, &waveforms).map_err(sds::Error::argument)?;
        log::info!("Waveforms written to {}", path);
    }
    Ok(())
}

fn print_summary(waveforms: &Waveforms) {
    let (channels, frames, points) = waveforms.shape();
    println!("{} channels x {} frames x {} points", channels, frames, points);
    for (i, name) in waveforms.channels.iter().enumerate() {
        let valid: Vec<f32> = waveforms.channel(i).iter().copied().filter(|x| !x.is_nan()).collect();
        if valid.is_empty() {
            println!("{}: no data", name);
            continue;
        }
        let min = valid.iter().copied().fold(f32::INFINITY, f32::min);
        let max = valid.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = valid.iter().map(|x| *x as f64).sum::<f64>() / valid.len() as f64;
        println!(
            "{}: min {:.4} V, mean {:.4} V, max {:.4} V ({} missing)",
            name,
            min,
            mean,
            max,
            waveforms.channel(i).len() - valid.len()
        );
    }
}

fn screenshot(scope: &Scope, matches: &ArgMatches) -> sds::Result<()> {
    let path = matches.value_of("file").unwrap_or_default();
    let data = scope.png()?;
    std::fs::write(path, &data).map_err(sds::Error::transport)?;
    println!("Saved {} bytes to {}", data.len(), path);
    Ok(())
}
