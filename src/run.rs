//! The supervisor: verifies credentials, wires tailers through parsers,
//! filters and the sampler into the shared uploader queue, and orchestrates
//! the drain on shutdown.
//!
//! Closure, not signalling, drives the drain. The stop flag only tells the
//! tailers to quit reading; every stage downstream finishes because its
//! input channel closed. Tailers close their line channels, parsers close
//! their event channels, the transform threads release their uploader
//! senders, the primary queue disconnects, the sender pool flushes and
//! exits, and the response task follows once the last sender is gone. Only
//! then is the final summary printed.

use config::Args;
use crossbeam_channel;
use event::Event;
use filter;
use filter::shape::{Pattern, QueryMode};
use filter::{Augmenter, FieldMutator, Filter, RequestShaper, TimeRebase};
use parser;
use parser::PrefixRegex;
use sample::{DynamicSampler, Sampler};
use serde_json::Value;
use sink;
use sink::{HoneycombConfig, Uploader};
use source;
use source::TailConfig;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const BACKFILL_MESSAGE: &str =
    "backfill mode may rate limit this dataset; that is expected, but other senders \
     to the same dataset may see events dropped";

/// Run the pipeline to completion. The return value is the process exit
/// code: 0 once all data drained, 1 on a startup-world failure.
pub fn run(args: Args, stop: Arc<AtomicBool>) -> i32 {
    info!("caudal {} starting", args.version);
    if args.backfill {
        info!("{}", BACKFILL_MESSAGE);
    }

    if !args.debug_stdout {
        if let Err(e) = sink::verify_write_key(&args.api_host, &args.write_key) {
            error!("{}", e);
            return 1;
        }
    }

    // compile the prefix regex once for use on all channels
    let prefix: Option<Arc<PrefixRegex>> = match args.prefix_regex {
        Some(ref pattern) => match PrefixRegex::new(pattern) {
            Ok(pre) => Some(Arc::new(pre)),
            Err(e) => {
                error!("log_prefix did not compile: {}", e);
                return 2;
            }
        },
        None => None,
    };

    let parser_options = parser_options(&args);

    let tail_config = TailConfig {
        paths: args.files.clone(),
        filter_paths: args.filter_files.clone(),
        read_from: args.read_from,
        stop_at_eof: args.tail_stop,
        poll: args.poll,
        checkpoint_file: args.state_file.clone(),
    };
    let tailers = match source::get_entries(&tail_config, Arc::clone(&stop)) {
        Ok(tailers) => tailers,
        Err(e) => {
            error!("error occurred while trying to tail: {}", e);
            return 1;
        }
    };

    // backfill rebasing needs a base timestamp before any event flows
    let rebase: Option<TimeRebase> = if args.rebase_time {
        let files: Vec<PathBuf> = tailers
            .iter()
            .filter(|t| t.name != "STDIN")
            .map(|t| PathBuf::from(&t.name))
            .collect();
        match filter::rebase::base_time(&files, &args.parser_name, &parser_options, prefix.clone())
        {
            Some(base) => Some(TimeRebase::new(base)),
            None => {
                error!("rebase_time specified but no base timestamp could be discovered");
                return 1;
            }
        }
    } else {
        None
    };

    let filters = match build_filters(&args, rebase) {
        Ok(filters) => Arc::new(filters),
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    let sampler = Arc::new(build_sampler(&args));

    let uploader_config = HoneycombConfig {
        api_host: args.api_host.clone(),
        write_key: args.write_key.clone(),
        dataset: args.dataset.clone(),
        pool_size: args.pool_size,
        batch_size: args.batch_size,
        flush_interval: Duration::from_millis(args.batch_frequency_ms),
        gzip: args.gzip,
        retry: args.backoff,
        debug_stdout: args.debug_stdout,
        status_interval: args.status_interval,
    };
    let uploader = match Uploader::start(uploader_config) {
        Ok(uploader) => uploader,
        Err(e) => {
            error!("error occurred while spinning up the sender pool: {}", e);
            return 1;
        }
    };

    // for each line channel, a parser instance feeding a transform thread;
    // the transform threads merge into the shared uploader queue
    let mut pipeline_handles = Vec::new();
    let mut tail_handles = Vec::new();
    for tailer in tailers {
        let source::Tailer {
            name,
            lines,
            handle,
        } = tailer;
        tail_handles.push(handle);

        let (unsampled_snd, unsampled_rcv) =
            crossbeam_channel::bounded::<Event>(args.pool_size);

        let parser_name = args.parser_name.clone();
        let options = parser_options.clone();
        let parse_prefix = prefix.clone();
        let builder = thread::Builder::new().name(format!("parse:{}", name));
        let parse_handle = builder
            .spawn(move || {
                let mut p = parser::new_parser(&parser_name)
                    .expect("parser name was validated at startup");
                if let Err(e) = p.init(&options) {
                    error!("error initializing {} parser module: {}", parser_name, e);
                    return;
                }
                p.process_lines(lines, unsampled_snd, parse_prefix);
            })
            .expect("spawning a parser thread");
        pipeline_handles.push(parse_handle);

        let to_send = uploader.sender();
        let filters = Arc::clone(&filters);
        let sampler = Arc::clone(&sampler);
        let presampled_field = args.presampled_field.clone();
        let builder = thread::Builder::new().name(format!("transform:{}", name));
        let transform_handle = builder
            .spawn(move || {
                for mut ev in unsampled_rcv.iter() {
                    filter::apply(&filters, &mut ev);
                    match presampled_field {
                        Some(ref field) => ev.sample_rate = presampled_rate(&ev, field),
                        None => sampler.sample(&mut ev),
                    }
                    if ev.dropped() {
                        trace!("dropped event due to sampling");
                        continue;
                    }
                    if to_send.send(ev).is_err() {
                        break;
                    }
                }
            })
            .expect("spawning a transform thread");
        pipeline_handles.push(transform_handle);
    }

    for handle in pipeline_handles {
        let _ = handle.join();
    }
    for handle in tail_handles {
        let _ = handle.join();
    }
    // every transform sender is gone; the uploader drains and reports
    uploader.wait();
    info!("caudal is all done, goodbye");
    0
}

fn parser_options(args: &Args) -> parser::Options {
    parser::Options {
        time_field: args.time_field.clone(),
        time_format: args.time_format.clone(),
        location: args.location,
        num_parsers: args.num_parsers,
        pre_sample_rate: if args.tail_sample { args.sample_rate } else { 1 },
        line_regex: args.line_regex.clone(),
    }
}

/// The transform chain, in its fixed order: request shaping, data
/// augmentation, field mutation, time rebasing.
fn build_filters(
    args: &Args,
    rebase: Option<TimeRebase>,
) -> Result<Vec<Box<dyn Filter>>, String> {
    let mut filters: Vec<Box<dyn Filter>> = Vec::new();
    if !args.request_shape.is_empty() {
        let patterns = args
            .request_patterns
            .iter()
            .map(|p| Pattern::compile(p))
            .collect();
        let mode = if args.request_query_all {
            QueryMode::All
        } else {
            QueryMode::Whitelist(args.request_query_keys.clone())
        };
        filters.push(Box::new(RequestShaper::new(
            args.shape_prefix.as_ref().map(|s| s.as_str()),
            args.request_shape.clone(),
            patterns,
            mode,
        )));
    }
    if let Some(ref path) = args.da_map_file {
        let augmenter = Augmenter::from_file(path)?;
        filters.push(Box::new(augmenter));
    }
    let mutator = FieldMutator::new(
        args.drop_fields.clone(),
        args.scrub_fields.clone(),
        args.add_fields.clone(),
        args.json_fields.clone(),
        args.rename_fields.clone(),
    );
    if !mutator.is_noop() {
        filters.push(Box::new(mutator));
    }
    if let Some(rebase) = rebase {
        filters.push(Box::new(rebase));
    }
    Ok(filters)
}

fn build_sampler(args: &Args) -> Sampler {
    if let Some(ref field) = args.deterministic_sample {
        return Sampler::deterministic(args.sample_rate, field);
    }
    if !args.dyn_sample.is_empty() {
        return Sampler::Dynamic {
            sampler: DynamicSampler::new(
                args.goal_sample_rate,
                args.dyn_window_sec,
                args.dyn_sample_minimum,
            ),
            fields: args.dyn_sample.clone(),
        };
    }
    if args.sample_rate > 1 {
        return Sampler::Static {
            rate: args.sample_rate,
            already_sampled: args.tail_sample,
        };
    }
    Sampler::None
}

/// A stream someone already sampled carries its rate in a field; pass it
/// through and bypass our own sampler entirely.
fn presampled_rate(ev: &Event, field: &str) -> i64 {
    match ev.data.get(field) {
        Some(&Value::Number(ref n)) => n.as_i64().unwrap_or(1),
        Some(&Value::String(ref s)) => s.parse().unwrap_or(1),
        _ => 1,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use event::Event;

    #[test]
    fn test_presampled_rate_forms() {
        let ev = Event::new()
            .insert_field("as_num", 12)
            .insert_field("as_str", "7")
            .insert_field("junk", "x");
        assert_eq!(presampled_rate(&ev, "as_num"), 12);
        assert_eq!(presampled_rate(&ev, "as_str"), 7);
        assert_eq!(presampled_rate(&ev, "junk"), 1);
        assert_eq!(presampled_rate(&ev, "absent"), 1);
    }
}
