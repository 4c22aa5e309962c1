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

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use log::info;
use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conf::{self, HttpdConf};
use crate::control::ServerControl;
use crate::core::config::{get_config_file, HarnessConfig};
use crate::curl::{Curl, CurlOptions};
use crate::env::{CertSpec, TestEnv};
use crate::exec::ProcessRunner;
use crate::extras::Extras;
use crate::response::Response;
use crate::setup::HttpdSetup;

#[derive(Parser, Clone)]
#[command(
    name = "httpd-harness",
    version,
    about = "Drives an httpd instance for protocol tests."
)]
pub struct CliArgs {
    #[arg(long, value_name = "file", help = "Config file.")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "file", help = "File to log to.")]
    pub logfile: Option<PathBuf>,

    #[arg(
        long,
        value_name = "x",
        default_value = "2",
        help = "Log level (default: 2)."
    )]
    pub loglevel: Option<String>,

    #[arg(long, action=ArgAction::SetTrue, help = "Verbose output. Same as --loglevel=3.")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Recreate the server directory from the test sources
    Setup,

    /// Start the server
    Start,

    /// Stop the server
    Stop,

    /// Gracefully reload the server configuration
    Reload,

    /// Reload a running server, or start it
    Restart {
        #[arg(long, action=ArgAction::SetTrue, help = "Stop and start instead of reloading.")]
        hard: bool,
    },

    /// Request urls with curl and show the responses
    Probe {
        #[arg(required = true, value_name = "url")]
        urls: Vec<String>,

        #[arg(long, action=ArgAction::SetTrue, help = "Skip certificate checks.")]
        insecure: bool,

        #[arg(long, value_name = "secs", default_value_t = 10, help = "Timeout in seconds.")]
        timeout: u64,

        #[arg(last = true, value_name = "curl options")]
        options: Vec<String>,
    },

    /// Generate the test configuration
    Conf {
        #[arg(long = "preset", value_name = "name")]
        presets: Vec<Preset>,

        #[arg(long = "extra", value_name = "KEY=DIRECTIVE")]
        extras: Vec<String>,

        #[arg(long, action=ArgAction::SetTrue, help = "Generate HTTP/2 configuration.")]
        h2: bool,

        #[arg(long, action=ArgAction::SetTrue, help = "Install instead of printing.")]
        install: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preset {
    Test1,
    Test2,
    Cgi,
    Noh2,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ArgsData {
    pub config_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: u8,
    pub command: Command,
}

impl ArgsData {
    pub fn new(cli_args: CliArgs) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            config_file: cli_args.config,
            log_file: cli_args.logfile,
            log_level: Self::get_log_level(cli_args.loglevel.as_deref(), cli_args.verbose)?,
            command: cli_args.command,
        })
    }

    fn get_log_level(level: Option<&str>, verbose: bool) -> Result<u8, Box<dyn Error>> {
        if verbose {
            return Ok(3);
        }

        let level = match level {
            Some(x) => x,
            // default log level imposed
            None => return Ok(2),
        };

        match level.trim().parse() {
            Ok(x) => Ok(x),
            Err(_) => Err("log level must be greater than or equal to 0".into()),
        }
    }
}

pub fn build_env(work_dir: &Path, config_file: Option<PathBuf>) -> Result<TestEnv, Box<dyn Error>> {
    let config_file = get_config_file(work_dir, config_file)?;

    info!("using config: {:?}", config_file.display());

    let config = match HarnessConfig::new(&config_file) {
        Ok(x) => x,
        Err(e) => return Err(format!("error: parsing config. {:?}", e).into()),
    };

    Ok(TestEnv::new(&config, work_dir))
}

/// Assembles the test configuration from presets. The extras come from
/// `KEY=DIRECTIVE` assignments.
pub fn build_conf<'a>(
    env: &'a TestEnv,
    presets: &[Preset],
    assignments: &[String],
    h2: bool,
) -> Result<HttpdConf<'a>, Box<dyn Error>> {
    let mut extras = Extras::new();
    for a in assignments {
        extras.add_assignment(a)?;
    }

    let extras = if extras.is_empty() {
        None
    } else {
        Some(&extras)
    };

    let mut conf = if h2 {
        HttpdConf::h2(env, extras)
    } else {
        HttpdConf::new(env, extras)
    };

    for preset in presets {
        match preset {
            Preset::Test1 => conf.add_vhost_test1(false, false),
            Preset::Test2 => conf.add_vhost_test2(),
            Preset::Cgi => conf.add_vhost_cgi(false, false),
            Preset::Noh2 => conf.add_vhost_noh2(),
        };
    }

    Ok(conf)
}

fn write_response<W: Write>(out: &mut W, resp: &Response) -> Result<(), io::Error> {
    // oldest first, the way they arrived
    let mut chain: Vec<&Response> = resp.chain().collect();
    chain.reverse();

    for r in chain {
        writeln!(out, "{} {} {}", r.protocol(), r.status(), r.reason())?;
        for (name, value) in r.headers().iter() {
            writeln!(out, "{}: {}", name, value)?;
        }
        writeln!(out)?;
    }

    out.write_all(resp.body())?;

    Ok(())
}

/// Runs a command, returning the exit code for the process.
pub fn run(work_dir: &Path, args: ArgsData) -> Result<i32, Box<dyn Error>> {
    let mut env = build_env(work_dir, args.config_file)?;

    if let Command::Conf { h2: true, .. } = args.command {
        let domains = conf::h2_cert_domains(&env.http_tld);
        env = env
            .add_base_conf(&conf::h2_base_conf())
            .add_cert_specs(vec![CertSpec::new(&domains)]);
    }

    let runner = ProcessRunner::new();
    let curl = Curl::new(&env, &runner);
    let mut control = ServerControl::new(&env, &runner, &curl);

    let code = match args.command {
        Command::Setup => {
            HttpdSetup::new(&env).make()?;
            0
        }
        Command::Start => control.start(),
        Command::Stop => control.stop(),
        Command::Reload => control.reload(),
        Command::Restart { hard } => {
            if hard {
                control.hard_restart()
            } else {
                control.observe();
                control.restart()
            }
        }
        Command::Probe {
            urls,
            insecure,
            timeout,
            options,
        } => {
            let mut opts = CurlOptions::default()
                .with_timeout(Duration::from_secs(timeout))
                .with_options(&options);
            opts.insecure = insecure;

            let urls: Vec<&str> = urls.iter().map(|s| s.as_str()).collect();
            let r = curl.raw(&urls, &opts)?;

            let stdout = io::stdout();
            let mut out = stdout.lock();

            match r.response() {
                Some(resp) => write_response(&mut out, resp)?,
                None => out.write_all(r.outraw())?,
            }

            if !r.stderr().is_empty() {
                eprint!("{}", r.stderr());
            }

            r.exit_code()
        }
        Command::Conf {
            presets,
            extras,
            h2,
            install,
        } => {
            let conf = build_conf(&env, &presets, &extras, h2)?;

            if install {
                conf.install()?;
                info!("installed {}", env.test_conf_path().display());
            } else {
                print!("{}", conf.document().text());
            }

            0
        }
    };

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::tests::test_env;
    use crate::response::parse_chain;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn parse_args() {
        let a = ArgsData::new(cli(&["httpd-harness", "start"])).unwrap();
        assert_eq!(
            a,
            ArgsData {
                config_file: None,
                log_file: None,
                log_level: 2,
                command: Command::Start,
            }
        );

        let a = ArgsData::new(cli(&[
            "httpd-harness",
            "--config",
            "/cfg/harness.conf",
            "--verbose",
            "restart",
            "--hard",
        ]))
        .unwrap();
        assert_eq!(a.config_file, Some(PathBuf::from("/cfg/harness.conf")));
        assert_eq!(a.log_level, 3);
        assert_eq!(a.command, Command::Restart { hard: true });
    }

    #[test]
    fn parse_probe_args() {
        let a = cli(&[
            "httpd-harness",
            "probe",
            "--insecure",
            "https://test1.example:5001/",
            "--",
            "--http2",
            "-v",
        ]);

        assert_eq!(
            a.command,
            Command::Probe {
                urls: vec!["https://test1.example:5001/".to_string()],
                insecure: true,
                timeout: 10,
                options: vec!["--http2".to_string(), "-v".to_string()],
            }
        );

        assert!(CliArgs::try_parse_from(["httpd-harness", "probe"]).is_err());
    }

    #[test]
    fn parse_conf_args() {
        let a = cli(&[
            "httpd-harness",
            "conf",
            "--preset",
            "test1",
            "--preset",
            "noh2",
            "--extra",
            "base=LogLevel debug",
            "--h2",
        ]);

        assert_eq!(
            a.command,
            Command::Conf {
                presets: vec![Preset::Test1, Preset::Noh2],
                extras: vec!["base=LogLevel debug".to_string()],
                h2: true,
                install: false,
            }
        );
    }

    #[test]
    fn bad_log_level() {
        let a = cli(&["httpd-harness", "--loglevel=-2", "stop"]);

        assert!(ArgsData::new(a).is_err());
    }

    #[test]
    fn conf_from_presets() {
        let env = test_env(Path::new("/work"));

        let conf = build_conf(
            &env,
            &[Preset::Test2],
            &["base=LogLevel debug".to_string()],
            false,
        )
        .unwrap();

        let lines = conf.lines();
        assert_eq!(lines[0], "LogLevel debug");
        assert_eq!(
            lines.iter().filter(|l| l.starts_with("<VirtualHost")).count(),
            2
        );
        assert_eq!(conf.document().depth(), 0);

        assert!(build_conf(&env, &[], &["nonsense".to_string()], false).is_err());
    }

    #[test]
    fn response_output() {
        let resp = parse_chain(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n",
            b"ok",
        )
        .unwrap()
        .unwrap();

        let mut out = Vec::new();
        write_response(&mut out, &resp).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 100 Continue\n\nHTTP/1.1 200 OK\ncontent-length: 2\n\nok"
        );
    }
}
