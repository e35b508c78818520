//! The locker-client executable sends one request to a running locker server.
//!
//! `locker-client [--addr IP:PORT] [--keyfile FILE] <SUBCOMMAND>`
//!
//! If the key file does not exist yet, the client first fetches the server's
//! public key and caches it there. Data-bearing replies are written to stdout;
//! every failure is a single line on stderr and a non-zero exit code.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::exit;

use clap::{crate_version, App, Arg, ArgMatches, SubCommand};
use locker::{LockerClient, Result};
use tracing::{Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:4000";
const DEFAULT_KEYFILE: &str = "server.pub";

fn main() {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let user_pass = [
        Arg::with_name("USER").required(true).index(1),
        Arg::with_name("PASS").required(true).index(2),
    ];
    let matches = App::new("locker-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("client for the locker key-value server")
        .arg(Arg::with_name("addr")
            .long("addr")
            .value_name("IP_ADDR:PORT")
            .help("sets the IP_ADDR:PORT of the server to connect to")
            .default_value(DEFAULT_ADDRESS))
        .arg(Arg::with_name("keyfile")
            .long("keyfile")
            .value_name("FILE")
            .help("where the server's public key is cached")
            .default_value(DEFAULT_KEYFILE))
        .subcommands(vec![
            SubCommand::with_name("reg")
                .about("Register a new user")
                .args(&user_pass),
            SubCommand::with_name("bye")
                .about("Shut the server down")
                .args(&user_pass),
            SubCommand::with_name("sav")
                .about("Snapshot the server's data file (admin only)")
                .args(&user_pass),
            SubCommand::with_name("set")
                .about("Replace your stored content")
                .args(&user_pass)
                .arg(Arg::with_name("CONTENT").required(true).index(3)),
            SubCommand::with_name("get")
                .about("Fetch a user's stored content")
                .args(&user_pass)
                .arg(Arg::with_name("WHO").required(true).index(3)),
            SubCommand::with_name("all")
                .about("List all usernames")
                .args(&user_pass),
            SubCommand::with_name("kvi")
                .about("Insert a key/value pair")
                .args(&user_pass)
                .arg(Arg::with_name("KEY").required(true).index(3))
                .arg(Arg::with_name("VALUE").required(true).index(4)),
            SubCommand::with_name("kvu")
                .about("Insert or update a key/value pair")
                .args(&user_pass)
                .arg(Arg::with_name("KEY").required(true).index(3))
                .arg(Arg::with_name("VALUE").required(true).index(4)),
            SubCommand::with_name("kvg")
                .about("Fetch the value of a key")
                .args(&user_pass)
                .arg(Arg::with_name("KEY").required(true).index(3)),
            SubCommand::with_name("kvd")
                .about("Delete a key")
                .args(&user_pass)
                .arg(Arg::with_name("KEY").required(true).index(3)),
            SubCommand::with_name("kva")
                .about("List all keys")
                .args(&user_pass),
            SubCommand::with_name("kvt")
                .about("List the most recently used keys")
                .args(&user_pass),
            SubCommand::with_name("kvf")
                .about("Register a map/reduce function from a file (admin only)")
                .args(&user_pass)
                .arg(Arg::with_name("NAME").required(true).index(3))
                .arg(Arg::with_name("FILE").required(true).index(4)),
            SubCommand::with_name("kvx")
                .about("Run a registered map/reduce function")
                .args(&user_pass)
                .arg(Arg::with_name("NAME").required(true).index(3)),
        ])
        .get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("{}", e);
        exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let addr = matches.value_of("addr").unwrap();
    let keyfile = matches.value_of("keyfile").unwrap();
    let client = connect(addr, keyfile)?;

    let (name, args) = match matches.subcommand() {
        (name, Some(args)) => (name, args),
        _ => {
            eprintln!("no command given; see locker-client --help");
            exit(1);
        }
    };
    let user = args.value_of("USER").unwrap();
    let pass = args.value_of("PASS").unwrap();

    match name {
        "reg" => client.register(user, pass)?,
        "bye" => client.bye(user, pass)?,
        "sav" => client.save(user, pass)?,
        "set" => {
            let content = args.value_of("CONTENT").unwrap();
            client.set_content(user, pass, content.as_bytes())?;
        }
        "get" => {
            let who = args.value_of("WHO").unwrap();
            emit(&client.get_content(user, pass, who)?)?;
        }
        "all" => {
            for name in client.all_users(user, pass)? {
                println!("{}", name);
            }
        }
        "kvi" => {
            let key = args.value_of("KEY").unwrap();
            let value = args.value_of("VALUE").unwrap();
            client.kv_insert(user, pass, key, value.as_bytes())?;
        }
        "kvu" => {
            let key = args.value_of("KEY").unwrap();
            let value = args.value_of("VALUE").unwrap();
            if client.kv_upsert(user, pass, key, value.as_bytes())? {
                println!("inserted");
            } else {
                println!("updated");
            }
        }
        "kvg" => {
            let key = args.value_of("KEY").unwrap();
            emit(&client.kv_get(user, pass, key)?)?;
        }
        "kvd" => {
            let key = args.value_of("KEY").unwrap();
            client.kv_delete(user, pass, key)?;
        }
        "kva" => {
            for key in client.kv_all(user, pass)? {
                println!("{}", key);
            }
        }
        "kvt" => {
            for key in client.kv_top(user, pass)? {
                println!("{}", key);
            }
        }
        "kvf" => {
            let fn_name = args.value_of("NAME").unwrap();
            let file = args.value_of("FILE").unwrap();
            let blob = fs::read(file)?;
            client.register_fn(user, pass, fn_name, &blob)?;
        }
        "kvx" => {
            let fn_name = args.value_of("NAME").unwrap();
            emit(&client.invoke_fn(user, pass, fn_name)?)?;
        }
        _ => unreachable!("clap rejects unknown subcommands"),
    }
    Ok(())
}

/// builds a client, fetching and caching the server's public key on first use
fn connect(addr: &str, keyfile: &str) -> Result<LockerClient> {
    let pem = if Path::new(keyfile).exists() {
        fs::read(keyfile)?
    } else {
        let pem = LockerClient::fetch_key(addr)?;
        fs::write(keyfile, &pem)?;
        pem
    };
    LockerClient::new(addr, &pem)
}

/// writes raw reply bytes to stdout
fn emit(data: &[u8]) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    out.write_all(data)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
