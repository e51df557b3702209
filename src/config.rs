//! Provides the CLI option parser
//!
//! Used to parse the argv/config file into a struct that the supervisor can
//! consume and use as configuration data. Flags given on the command line
//! win over values from the TOML config file. Configuration mistakes are
//! reported with the offending key and terminate the process with exit
//! code 2 before any part of the pipeline starts.

use chrono::FixedOffset;
use clap::{App, Arg, ArgMatches};
use parser;
use source::ReadFrom;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use time;
use time::TimeLocation;
use toml;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug)]
pub struct Args {
    pub files: Vec<String>,
    pub filter_files: Vec<String>,
    pub parser_name: String,
    pub write_key: String,
    pub dataset: String,
    pub api_host: String,
    pub sample_rate: i64,
    pub pool_size: usize,
    pub batch_frequency_ms: u64,
    pub batch_size: usize,
    pub status_interval: u64,
    pub backfill: bool,
    pub rebase_time: bool,
    pub backoff: bool,
    pub gzip: bool,
    pub debug_stdout: bool,
    pub scrub_fields: Vec<String>,
    pub drop_fields: Vec<String>,
    pub add_fields: Vec<(String, String)>,
    pub da_map_file: Option<PathBuf>,
    pub request_shape: Vec<String>,
    pub shape_prefix: Option<String>,
    pub request_patterns: Vec<String>,
    pub request_query_all: bool,
    pub request_query_keys: Vec<String>,
    pub prefix_regex: Option<String>,
    pub deterministic_sample: Option<String>,
    pub dyn_sample: Vec<String>,
    pub dyn_window_sec: u64,
    pub dyn_sample_minimum: i64,
    pub goal_sample_rate: i64,
    pub presampled_field: Option<String>,
    pub json_fields: Vec<String>,
    pub rename_fields: Vec<(String, String)>,
    pub read_from: ReadFrom,
    pub tail_stop: bool,
    pub poll: bool,
    pub state_file: Option<PathBuf>,
    pub tail_sample: bool,
    pub num_parsers: usize,
    pub time_field: Option<String>,
    pub time_format: Option<String>,
    pub location: TimeLocation,
    pub line_regex: Option<String>,
    pub verbose: u64,
    pub version: String,
}

/// The TOML face of `Args`; every knob optional so the command line can
/// fill the gaps.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    file: Option<Vec<String>>,
    filter_file: Option<Vec<String>>,
    parser: Option<String>,
    writekey: Option<String>,
    dataset: Option<String>,
    api_host: Option<String>,
    samplerate: Option<i64>,
    poolsize: Option<usize>,
    send_frequency_ms: Option<u64>,
    send_batch_size: Option<usize>,
    status_interval: Option<u64>,
    backfill: Option<bool>,
    rebase_time: Option<bool>,
    backoff: Option<bool>,
    no_gzip: Option<bool>,
    debug_stdout: Option<bool>,
    scrub_field: Option<Vec<String>>,
    drop_field: Option<Vec<String>>,
    add_field: Option<Vec<String>>,
    da_map_file: Option<String>,
    request_shape: Option<Vec<String>>,
    shape_prefix: Option<String>,
    request_pattern: Option<Vec<String>>,
    request_parse_query: Option<String>,
    request_query_keys: Option<Vec<String>>,
    log_prefix: Option<String>,
    deterministic_sampling: Option<String>,
    dynsampling: Option<Vec<String>>,
    dynsample_window: Option<u64>,
    dynsample_minimum: Option<i64>,
    presampled: Option<String>,
    json_field: Option<Vec<String>>,
    rename_field: Option<Vec<String>>,
    read_from: Option<String>,
    stop: Option<bool>,
    poll: Option<bool>,
    statefile: Option<String>,
    num_parsers: Option<usize>,
    timefield: Option<String>,
    time_format: Option<String>,
    localtime: Option<bool>,
    timezone: Option<String>,
    line_regex: Option<String>,
}

fn fatal(key: &str, msg: &str) -> ! {
    eprintln!("configuration error ({}): {}", key, msg);
    process::exit(2);
}

fn split_kv(key: &str, raw: &str) -> (String, String) {
    let mut parts = raw.splitn(2, '=');
    let k = parts.next().unwrap_or("");
    match parts.next() {
        Some(v) if !k.is_empty() => (k.to_string(), v.to_string()),
        _ => fatal(key, &format!("{:?} is not a key=val pair", raw)),
    }
}

fn strings(matches: &ArgMatches, name: &str, file_val: Option<Vec<String>>) -> Vec<String> {
    if matches.is_present(name) {
        matches
            .values_of(name)
            .map(|vs| vs.map(|v| v.to_string()).collect())
            .unwrap_or_default()
    } else {
        file_val.unwrap_or_default()
    }
}

fn string(matches: &ArgMatches, name: &str, file_val: Option<String>) -> Option<String> {
    if matches.is_present(name) {
        matches.value_of(name).map(|v| v.to_string())
    } else {
        file_val
    }
}

fn number<T>(matches: &ArgMatches, name: &str, file_val: Option<T>, default: T) -> T
where
    T: FromStr + Copy,
{
    if matches.is_present(name) {
        let raw = matches.value_of(name).unwrap_or("");
        match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => fatal(name, &format!("{:?} is not a number", raw)),
        }
    } else {
        file_val.unwrap_or(default)
    }
}

fn flag(matches: &ArgMatches, name: &str, file_val: Option<bool>) -> bool {
    matches.is_present(name) || file_val.unwrap_or(false)
}

pub fn parse_args() -> Args {
    let matches = App::new("caudal")
        .version(VERSION.unwrap_or("unknown"))
        .about("tail log files, parse them into events and ship them upstream")
        .arg(Arg::with_name("config-file")
             .long("config")
             .short("c")
             .value_name("config")
             .help("TOML config file; command line flags win on conflict.")
             .takes_value(true))
        .arg(Arg::with_name("file")
             .long("file")
             .short("f")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("Log file(s) to tail. Globs are allowed; '-' means stdin."))
        .arg(Arg::with_name("filter-file")
             .long("filter-file")
             .short("F")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("Glob(s) of files to exclude from --file expansion."))
        .arg(Arg::with_name("parser")
             .long("parser")
             .short("p")
             .takes_value(true)
             .help("Parser module for the log format: json, keyval or regex."))
        .arg(Arg::with_name("writekey")
             .long("writekey")
             .short("k")
             .takes_value(true)
             .help("Team write key used to authenticate against the API."))
        .arg(Arg::with_name("dataset")
             .long("dataset")
             .short("d")
             .takes_value(true)
             .help("Dataset the events are written into."))
        .arg(Arg::with_name("api_host")
             .long("api_host")
             .takes_value(true)
             .help("Base URL of the API."))
        .arg(Arg::with_name("samplerate")
             .long("samplerate")
             .short("r")
             .takes_value(true)
             .help("Only send 1 / N log lines."))
        .arg(Arg::with_name("poolsize")
             .long("poolsize")
             .short("P")
             .takes_value(true)
             .help("Number of concurrent senders."))
        .arg(Arg::with_name("send_frequency_ms")
             .long("send_frequency_ms")
             .takes_value(true)
             .help("How often to flush a partial batch, in milliseconds."))
        .arg(Arg::with_name("send_batch_size")
             .long("send_batch_size")
             .takes_value(true)
             .help("Maximum number of events per batch."))
        .arg(Arg::with_name("status_interval")
             .long("status_interval")
             .takes_value(true)
             .help("Seconds between summary reports; 0 disables them."))
        .arg(Arg::with_name("backfill")
             .long("backfill")
             .help("Ingest old data: read from the beginning, stop at EOF, retry on rate limit."))
        .arg(Arg::with_name("rebase_time")
             .long("rebase_time")
             .help("When backfilling, shift timestamps so the data ends near now."))
        .arg(Arg::with_name("backoff")
             .long("backoff")
             .help("Retry events the API rate limited or errored instead of dropping them."))
        .arg(Arg::with_name("no_gzip")
             .long("no_gzip")
             .help("Send request bodies uncompressed."))
        .arg(Arg::with_name("debug_stdout")
             .long("debug_stdout")
             .help("Print events to stdout instead of sending them."))
        .arg(Arg::with_name("scrub_field")
             .long("scrub_field")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("Replace this field's value with its SHA-256 hex digest."))
        .arg(Arg::with_name("drop_field")
             .long("drop_field")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("Remove this field before sending."))
        .arg(Arg::with_name("add_field")
             .long("add_field")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("key=val pair added to every event."))
        .arg(Arg::with_name("da_map_file")
             .long("da_map_file")
             .takes_value(true)
             .help("JSON file mapping a source field's values to extra fields."))
        .arg(Arg::with_name("request_shape")
             .long("request_shape")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("Field holding an HTTP request line to break into components."))
        .arg(Arg::with_name("shape_prefix")
             .long("shape_prefix")
             .takes_value(true)
             .help("Prefix for fields generated by request shaping."))
        .arg(Arg::with_name("request_pattern")
             .long("request_pattern")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("Path pattern with :name params; first match wins."))
        .arg(Arg::with_name("request_parse_query")
             .long("request_parse_query")
             .takes_value(true)
             .help("How to expand query params: whitelist or all."))
        .arg(Arg::with_name("request_query_keys")
             .long("request_query_keys")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("Query keys extracted when request_parse_query is whitelist."))
        .arg(Arg::with_name("log_prefix")
             .long("log_prefix")
             .takes_value(true)
             .help("Regex stripped from each line before parsing; named groups become fields."))
        .arg(Arg::with_name("deterministic_sampling")
             .long("deterministic_sampling")
             .takes_value(true)
             .help("Sample deterministically on this field's value."))
        .arg(Arg::with_name("dynsampling")
             .long("dynsampling")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("Sample dynamically keyed on these fields."))
        .arg(Arg::with_name("dynsample_window")
             .long("dynsample_window")
             .takes_value(true)
             .help("Measurement window for the dynamic sampler, in seconds."))
        .arg(Arg::with_name("dynsample_minimum")
             .long("dynsample_minimum")
             .takes_value(true)
             .help("Below this events/sec the dynamic sampler keeps everything."))
        .arg(Arg::with_name("presampled")
             .long("presampled")
             .takes_value(true)
             .help("Field carrying an upstream sample rate to pass through unchanged."))
        .arg(Arg::with_name("json_field")
             .long("json_field")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("String field to decode as a nested JSON object."))
        .arg(Arg::with_name("rename_field")
             .long("rename_field")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true)
             .help("before=after field rename."))
        .arg(Arg::with_name("read_from")
             .long("tail.read_from")
             .takes_value(true)
             .help("Where to start reading: beginning, end or last."))
        .arg(Arg::with_name("stop")
             .long("tail.stop")
             .help("Stop at end of file instead of waiting for more data."))
        .arg(Arg::with_name("poll")
             .long("tail.poll")
             .help("Poll for file changes instead of waiting on filesystem events."))
        .arg(Arg::with_name("statefile")
             .long("tail.statefile")
             .takes_value(true)
             .help("Where to store the read position. Per-file defaults when tailing several files."))
        .arg(Arg::with_name("timefield")
             .long("timefield")
             .takes_value(true)
             .help("Field that contains the record timestamp."))
        .arg(Arg::with_name("time_format")
             .long("time_format")
             .takes_value(true)
             .help("strftime format of the timestamp field."))
        .arg(Arg::with_name("localtime")
             .long("localtime")
             .help("Assume zoneless timestamps are local time rather than UTC."))
        .arg(Arg::with_name("timezone")
             .long("timezone")
             .takes_value(true)
             .help("Fixed offset (+HH:MM) assumed for zoneless timestamps."))
        .arg(Arg::with_name("line_regex")
             .long("regex.line_regex")
             .takes_value(true)
             .help("Line pattern with named capture groups, for the regex parser."))
        .arg(Arg::with_name("verbose")
             .short("v")
             .multiple(true)
             .help("Turn on verbose output."))
        .get_matches();

    let file_config = match matches.value_of("config-file") {
        Some(filename) => {
            let mut fp = match File::open(filename) {
                Ok(fp) => fp,
                Err(e) => fatal("config", &format!("could not open {}: {}", filename, e)),
            };
            let mut buffer = String::new();
            if let Err(e) = fp.read_to_string(&mut buffer) {
                fatal("config", &format!("could not read {}: {}", filename, e));
            }
            match toml::from_str::<FileConfig>(&buffer) {
                Ok(config) => config,
                Err(e) => fatal("config", &format!("could not decode {}: {}", filename, e)),
            }
        }
        None => FileConfig::default(),
    };

    let verbose = if matches.is_present("verbose") {
        matches.occurrences_of("verbose")
    } else {
        0
    };

    let mut args = Args {
        files: strings(&matches, "file", file_config.file),
        filter_files: strings(&matches, "filter-file", file_config.filter_file),
        parser_name: string(&matches, "parser", file_config.parser).unwrap_or_default(),
        write_key: string(&matches, "writekey", file_config.writekey).unwrap_or_default(),
        dataset: string(&matches, "dataset", file_config.dataset).unwrap_or_default(),
        api_host: string(&matches, "api_host", file_config.api_host)
            .unwrap_or_else(|| "https://api.honeycomb.io/".to_string()),
        sample_rate: number(&matches, "samplerate", file_config.samplerate, 1),
        pool_size: number(&matches, "poolsize", file_config.poolsize, 80),
        batch_frequency_ms: number(&matches, "send_frequency_ms", file_config.send_frequency_ms, 100),
        batch_size: number(&matches, "send_batch_size", file_config.send_batch_size, 50),
        status_interval: number(&matches, "status_interval", file_config.status_interval, 60),
        backfill: flag(&matches, "backfill", file_config.backfill),
        rebase_time: flag(&matches, "rebase_time", file_config.rebase_time),
        backoff: flag(&matches, "backoff", file_config.backoff),
        gzip: !flag(&matches, "no_gzip", file_config.no_gzip),
        debug_stdout: flag(&matches, "debug_stdout", file_config.debug_stdout),
        scrub_fields: strings(&matches, "scrub_field", file_config.scrub_field),
        drop_fields: strings(&matches, "drop_field", file_config.drop_field),
        add_fields: strings(&matches, "add_field", file_config.add_field)
            .iter()
            .map(|kv| split_kv("add_field", kv))
            .collect(),
        da_map_file: string(&matches, "da_map_file", file_config.da_map_file).map(PathBuf::from),
        request_shape: strings(&matches, "request_shape", file_config.request_shape),
        shape_prefix: string(&matches, "shape_prefix", file_config.shape_prefix),
        request_patterns: strings(&matches, "request_pattern", file_config.request_pattern),
        request_query_all: false,
        request_query_keys: strings(&matches, "request_query_keys", file_config.request_query_keys),
        prefix_regex: string(&matches, "log_prefix", file_config.log_prefix),
        deterministic_sample: string(
            &matches,
            "deterministic_sampling",
            file_config.deterministic_sampling,
        ),
        dyn_sample: strings(&matches, "dynsampling", file_config.dynsampling),
        dyn_window_sec: number(&matches, "dynsample_window", file_config.dynsample_window, 30),
        dyn_sample_minimum: number(&matches, "dynsample_minimum", file_config.dynsample_minimum, 1),
        goal_sample_rate: 0,
        presampled_field: string(&matches, "presampled", file_config.presampled),
        json_fields: strings(&matches, "json_field", file_config.json_field),
        rename_fields: strings(&matches, "rename_field", file_config.rename_field)
            .iter()
            .map(|kv| split_kv("rename_field", kv))
            .collect(),
        read_from: ReadFrom::Last,
        tail_stop: flag(&matches, "stop", file_config.stop),
        poll: flag(&matches, "poll", file_config.poll),
        state_file: string(&matches, "statefile", file_config.statefile).map(PathBuf::from),
        tail_sample: false,
        // raising this trades per-file event order for parse throughput, so
        // it is a config-file-only knob
        num_parsers: file_config.num_parsers.unwrap_or(1),
        time_field: string(&matches, "timefield", file_config.timefield),
        time_format: string(&matches, "time_format", file_config.time_format)
            .map(|f| time::convert_time_format(&f)),
        location: TimeLocation::Utc,
        line_regex: string(&matches, "line_regex", file_config.line_regex),
        verbose: verbose,
        version: VERSION.unwrap_or("unknown").to_string(),
    };

    let read_from_raw =
        string(&matches, "read_from", file_config.read_from).unwrap_or_else(|| "last".to_string());
    args.read_from = match read_from_raw.as_str() {
        "start" | "beginning" => ReadFrom::Beginning,
        "end" => ReadFrom::End,
        "last" => ReadFrom::Last,
        other => fatal("tail.read_from", &format!("unknown start location {:?}", other)),
    };

    let parse_query =
        string(&matches, "request_parse_query", file_config.request_parse_query)
            .unwrap_or_else(|| "whitelist".to_string());
    args.request_query_all = match parse_query.as_str() {
        "all" => true,
        "whitelist" => false,
        other => fatal(
            "request_parse_query",
            &format!("{:?} is neither \"whitelist\" nor \"all\"", other),
        ),
    };

    let localtime = flag(&matches, "localtime", file_config.localtime);
    let timezone = string(&matches, "timezone", file_config.timezone);
    args.location = match (localtime, timezone) {
        (_, Some(tz)) => TimeLocation::Fixed(parse_offset(&tz)),
        (true, None) => TimeLocation::Local,
        (false, None) => TimeLocation::Utc,
    };

    finalize(args)
}

/// `+HH:MM`, `-HH:MM`, `+HHMM` fixed offsets.
fn parse_offset(raw: &str) -> FixedOffset {
    let bad = || fatal("timezone", &format!("{:?} is not a +HH:MM offset", raw));
    if raw.len() < 5 {
        bad();
    }
    let (sign, rest) = raw.split_at(1);
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        bad();
    }
    let hours: i32 = digits[..2].parse().unwrap_or(99);
    let minutes: i32 = digits[2..].parse().unwrap_or(99);
    if hours > 23 || minutes > 59 {
        bad();
    }
    let total = (hours * 3600 + minutes * 60) * if sign == "-" { -1 } else { 1 };
    match FixedOffset::east_opt(total) {
        Some(off) => off,
        None => bad(),
    }
}

/// Cross-flag validation, mode interactions and derived settings.
fn finalize(mut args: Args) -> Args {
    if args.files.is_empty() {
        fatal("file", "at least one --file to tail is required");
    }
    if args.parser_name.is_empty() {
        fatal("parser", "a --parser is required: json, keyval or regex");
    }
    if parser::new_parser(&args.parser_name).is_none() {
        fatal(
            "parser",
            &format!("unknown parser {:?}; valid parsers are json, keyval, regex", args.parser_name),
        );
    }
    if !args.debug_stdout {
        if args.write_key.is_empty() {
            fatal("writekey", "a --writekey is required to send events");
        }
        if args.dataset.is_empty() {
            fatal("dataset", "a --dataset is required to send events");
        }
    }
    if args.sample_rate < 1 {
        fatal("samplerate", "sample rate must be a positive integer");
    }
    if args.pool_size < 1 {
        fatal("poolsize", "sender pool must have at least one worker");
    }
    if args.num_parsers < 1 {
        fatal("num_parsers", "at least one parse worker is required");
    }
    if !args.api_host.ends_with('/') {
        args.api_host.push('/');
    }

    let mut sampling_modes = 0;
    if args.deterministic_sample.is_some() {
        sampling_modes += 1;
    }
    if !args.dyn_sample.is_empty() {
        sampling_modes += 1;
    }
    if args.presampled_field.is_some() {
        sampling_modes += 1;
    }
    if sampling_modes > 1 {
        fatal(
            "sampling",
            "deterministic_sampling, dynsampling and presampled are mutually exclusive",
        );
    }

    if let Some(ref pattern) = args.prefix_regex {
        if let Err(e) = parser::PrefixRegex::new(pattern) {
            fatal("log_prefix", &format!("{}", e));
        }
    }

    if args.backfill {
        args.read_from = ReadFrom::Beginning;
        args.tail_stop = true;
        args.backoff = true;
    }

    if !args.dyn_sample.is_empty() {
        // the configured rate becomes the aggregate goal; the static rate
        // steps aside
        args.goal_sample_rate = args.sample_rate;
        args.sample_rate = 1;
    }

    // static sampling is cheapest at record boundaries, before the parse
    // cost is paid; that only works for parsers that group records, and
    // never when another mode owns the decision
    args.tail_sample = args.sample_rate > 1
        && args.parser_name == "json"
        && args.deterministic_sample.is_none()
        && args.dyn_sample.is_empty()
        && args.presampled_field.is_none();

    args
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_offset_forms() {
        assert_eq!(parse_offset("+05:30"), FixedOffset::east_opt(19800).unwrap());
        assert_eq!(parse_offset("-0800"), FixedOffset::east_opt(-28800).unwrap());
    }

    #[test]
    fn test_split_kv() {
        assert_eq!(
            split_kv("add_field", "env=prod"),
            ("env".to_string(), "prod".to_string())
        );
        assert_eq!(
            split_kv("add_field", "note=a=b"),
            ("note".to_string(), "a=b".to_string())
        );
    }
}
