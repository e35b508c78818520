//! this binary starts the locker server
//! to see the list of command line switches, type: `locker-server --help`

use std::path::PathBuf;
use std::process::exit;

use clap::{crate_version, App, Arg, ArgMatches};
use locker::thread_pool::SharedQueueThreadPool;
use locker::{crypto, LockerError, LockerServer, Result, Storage, StorageConfig, ThreadPool};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    port: u16,
    datafile: PathBuf,
    keyfile: String,
    threads: u32,
    buckets: usize,
    quota_interval: u64,
    up_quota: u64,
    down_quota: u64,
    req_quota: u64,
    top_size: usize,
    admin: String,
}

impl Opt {
    /// validates the raw string arguments and builds an `Opt`
    /// # Errors
    /// returns [`LockerError::Parsing`] if any numeric switch does not parse
    fn build(matches: &ArgMatches) -> Result<Opt> {
        Ok(Opt {
            port: parse_num(matches, "port")?,
            datafile: PathBuf::from(matches.value_of("datafile").unwrap()),
            keyfile: matches.value_of("keyfile").unwrap().to_string(),
            threads: parse_num(matches, "threads")?,
            buckets: parse_num(matches, "buckets")?,
            quota_interval: parse_num(matches, "interval")?,
            up_quota: parse_num(matches, "upquota")?,
            down_quota: parse_num(matches, "downquota")?,
            req_quota: parse_num(matches, "reqquota")?,
            top_size: parse_num(matches, "topsize")?,
            admin: matches.value_of("admin").unwrap().to_string(),
        })
    }
}

/// parses the value of the switch named `name` into any number type
fn parse_num<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<T> {
    let raw = matches.value_of(name).unwrap();
    raw.parse().map_err(|_| {
        LockerError::Parsing(format!("could not parse {} as a value for -{}", raw, name))
    })
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    // parse command line args
    let matches = App::new("locker-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("an authenticated, persistent, multi-threaded key-value server")
        .arg(Arg::with_name("port")
            .short("p")
            .value_name("PORT")
            .help("Port on which to listen for incoming connections")
            .default_value("4000"))
        .arg(Arg::with_name("datafile")
            .short("f")
            .value_name("FILE")
            .help("File for storing all data")
            .default_value("locker.dat"))
        .arg(Arg::with_name("keyfile")
            .short("k")
            .value_name("BASENAME")
            .help("Basename of the files for storing the server's RSA keys")
            .default_value("rsa"))
        .arg(Arg::with_name("threads")
            .short("t")
            .value_name("NUM")
            .help("Number of worker threads serving clients")
            .default_value("8"))
        .arg(Arg::with_name("buckets")
            .short("b")
            .value_name("NUM")
            .help("Number of buckets in the hash tables")
            .default_value("16"))
        .arg(Arg::with_name("interval")
            .short("i")
            .value_name("SECONDS")
            .help("Seconds over which quotas are enforced")
            .default_value("60"))
        .arg(Arg::with_name("upquota")
            .short("u")
            .value_name("BYTES")
            .help("Upload quota per user per interval")
            .default_value("1048576"))
        .arg(Arg::with_name("downquota")
            .short("d")
            .value_name("BYTES")
            .help("Download quota per user per interval")
            .default_value("1048576"))
        .arg(Arg::with_name("reqquota")
            .short("r")
            .value_name("NUM")
            .help("Request quota per user per interval")
            .default_value("8192"))
        .arg(Arg::with_name("topsize")
            .short("o")
            .value_name("NUM")
            .help("Number of keys tracked for top queries")
            .default_value("4"))
        .arg(Arg::with_name("admin")
            .short("a")
            .value_name("USER")
            .help("Name of the administrator user")
            .default_value("admin"))
        .get_matches();

    let opt = match Opt::build(&matches) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{:?}", err);
            exit(1);
        }
    };

    // start the server; run only returns cleanly after an authenticated BYE
    if let Err(e) = run(opt) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("locker-server {}", env!("CARGO_PKG_VERSION"));
    info!(
        "using (key/data) = ({}, {})",
        opt.keyfile,
        opt.datafile.display()
    );

    // if neither key file exists a fresh pair is generated; exactly one is fatal
    let private_key = crypto::init_keypair(&opt.keyfile)?;
    let public_pem = crypto::load_public_pem(&opt.keyfile)?;

    let storage = Storage::open(StorageConfig {
        datafile: opt.datafile,
        buckets: opt.buckets,
        up_quota: opt.up_quota,
        down_quota: opt.down_quota,
        req_quota: opt.req_quota,
        quota_dur: opt.quota_interval,
        top_size: opt.top_size,
        admin: opt.admin,
    })?;

    let pool = SharedQueueThreadPool::new(opt.threads)?;
    let server = LockerServer::new(storage, pool, private_key, public_pem);
    server.run(("0.0.0.0", opt.port))
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than TRACE (e.g, debug, info, warn, etc.)
        // will be written to stdout.
        .with_max_level(Level::INFO)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
