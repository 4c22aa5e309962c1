/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::Parser;
use httpd_harness::core::log::{
    ensure_init_simple_logger, get_simple_logger, level_filter, local_offset_check, open_log_file,
};
use httpd_harness::core::version;
use httpd_harness::runner::{run, ArgsData, CliArgs};
use log::{debug, error};
use std::env;
use std::error::Error;
use std::process;

fn process_args_and_run(args: CliArgs) -> Result<i32, Box<dyn Error>> {
    let args_data = ArgsData::new(args)?;

    let log_file = match &args_data.log_file {
        Some(x) => match open_log_file(x) {
            Ok(x) => Some(x),
            Err(_) => {
                error!("unable to open log file. logging to standard out.");
                None
            }
        },
        None => None,
    };
    ensure_init_simple_logger(log_file);
    log::set_logger(get_simple_logger()).map_err(|e| format!("unable to set logger: {}", e))?;
    log::set_max_level(level_filter(args_data.log_level));

    local_offset_check();

    debug!("httpd-harness {}: {:?}", version(), args_data.command);

    run(&env::current_dir()?, args_data)
}

fn main() {
    let args = CliArgs::parse();

    match process_args_and_run(args) {
        Ok(code) => process::exit(if code < 0 { 1 } else { code }),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
