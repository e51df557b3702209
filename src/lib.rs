extern crate chrono;
extern crate clap;
extern crate crossbeam_channel;
extern crate flate2;
extern crate glob;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate notify;
extern crate rand;
extern crate regex;
extern crate reqwest;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
extern crate sha1;
extern crate sha2;
extern crate toml;
extern crate url;

pub mod config;
pub mod event;
pub mod filter;
pub mod parser;
pub mod run;
pub mod sample;
pub mod sink;
pub mod source;
pub mod time;
pub mod util;
