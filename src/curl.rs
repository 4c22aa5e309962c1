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

//! Probing the server with curl.
//!
//! Curl writes the response headers of every exchange, interim responses
//! included, to a side-channel file given with `-D`. That file is read back
//! and fed through the response chain parser along with curl's stdout.

use crate::control::LivenessProbe;
use crate::env::{CredentialStore, TestEnv, SERVER_ADDR};
use crate::exec::{CommandRunner, ExecResult, EXIT_TIMEOUT};
use crate::response::{self, ParseError};
use log::debug;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// curl's own exit code for an operation that ran out of time
const CURL_TIMED_OUT: i32 = 28;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("url has no host: {0}")]
    MissingHost(String),

    #[error("url has no port: {0}")]
    MissingPort(String),

    #[error("malformed response headers: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct CurlOptions {
    pub timeout: Option<Duration>,

    /// Passed to curl verbatim, ahead of the urls.
    pub options: Vec<String>,

    pub insecure: bool,

    /// Resolve the url's host to the server address.
    pub force_resolve: bool,
}

impl Default for CurlOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            options: Vec::new(),
            insecure: false,
            force_resolve: true,
        }
    }
}

impl CurlOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);

        self
    }

    pub fn with_options<S: AsRef<str>>(mut self, options: &[S]) -> Self {
        self.options
            .extend(options.iter().map(|s| s.as_ref().to_string()));

        self
    }

    pub fn insecure(mut self) -> Self {
        self.insecure = true;

        self
    }

    fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|o| o == name)
    }
}

// hosts that need no name resolution
fn is_literal_host(host: &str) -> bool {
    host == "localhost"
        || host == SERVER_ADDR
        || host.starts_with(|c: char| c.is_ascii_digit() || c == '[' || c == ':')
}

fn format_timeout(timeout: Duration) -> String {
    format!("{}", timeout.as_secs_f64())
}

pub struct Curl<'a> {
    env: &'a TestEnv,
    runner: &'a dyn CommandRunner,
}

impl<'a> Curl<'a> {
    pub fn new(env: &'a TestEnv, runner: &'a dyn CommandRunner) -> Self {
        Self { env, runner }
    }

    /// Builds the full curl command line for probing `urls`. The first url
    /// decides the scheme specific arguments.
    pub fn complete_args(&self, urls: &[&str], opts: &CurlOptions) -> Result<Vec<String>, ProbeError> {
        let first = match urls.first() {
            Some(u) => Url::parse(u)?,
            None => return Err(ProbeError::InvalidUrl(url::ParseError::EmptyHost)),
        };

        let host = match first.host_str() {
            Some(h) => h.to_string(),
            None => return Err(ProbeError::MissingHost(first.to_string())),
        };

        let port = match first.port_or_known_default() {
            Some(p) => p,
            None => return Err(ProbeError::MissingPort(first.to_string())),
        };

        let mut args = vec![
            self.env.curl.clone(),
            "-s".to_string(),
            "-D".to_string(),
            self.env.curl_headerfile().display().to_string(),
        ];

        if first.scheme() == "https" {
            if opts.insecure {
                args.push("--insecure".to_string());
            } else if !opts.has_option("--cacert")
                && !self.env.credentials_for_name(&host).is_empty()
            {
                args.push("--cacert".to_string());
                args.push(self.env.ca_cert_file().display().to_string());
            }
        }

        if opts.force_resolve && !is_literal_host(&host) {
            args.push("--resolve".to_string());
            args.push(format!("{}:{}:{}", host, port, SERVER_ADDR));
        }

        if let Some(timeout) = opts.timeout {
            args.push("--connect-timeout".to_string());
            args.push(format_timeout(timeout));
        }

        args.extend(opts.options.iter().cloned());
        args.extend(urls.iter().map(|u| u.to_string()));

        Ok(args)
    }

    /// Runs curl against `urls` and parses the captured response chain.
    ///
    /// A curl failure is not an error: it is reported in the exit code of
    /// the result, which then carries no response.
    pub fn raw(&self, urls: &[&str], opts: &CurlOptions) -> Result<ExecResult, ProbeError> {
        let args = self.complete_args(urls, opts)?;
        let headerfile = self.env.curl_headerfile();

        remove_stale(&headerfile)?;

        let r = self.runner.run(&args, None, opts.timeout);
        if !r.succeeded() {
            debug!("curl exited with {}", r.exit_code());
            return Ok(r);
        }

        let header_data = match fs::read(&headerfile) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let resp = response::parse_chain(&header_data, r.outraw())?;

        Ok(r.with_response(resp))
    }

    pub fn get(&self, url: &str, opts: &CurlOptions) -> Result<ExecResult, ProbeError> {
        self.raw(&[url], opts)
    }

    pub fn post_data(&self, url: &str, data: &str, opts: &CurlOptions) -> Result<ExecResult, ProbeError> {
        let opts = opts.clone().with_options(&["--data", data]);

        self.raw(&[url], &opts)
    }

    /// Posts a single form field.
    pub fn post_value(
        &self,
        url: &str,
        name: &str,
        value: &str,
        opts: &CurlOptions,
    ) -> Result<ExecResult, ProbeError> {
        let field = format!("{}={}", name, value);
        let opts = opts.clone().with_options(&["--form", field.as_str()]);

        self.raw(&[url], &opts)
    }

    /// Uploads `path` as the form field `file`.
    pub fn upload(&self, url: &str, path: &Path, opts: &CurlOptions) -> Result<ExecResult, ProbeError> {
        let field = format!("file=@{}", path.display());
        let opts = opts.clone().with_options(&["--form", field.as_str()]);

        self.raw(&[url], &opts)
    }

    /// Returns the HTTP version curl negotiated, e.g. `1.1` or `2`.
    pub fn protocol_version(&self, url: &str, opts: &CurlOptions) -> Result<Option<String>, ProbeError> {
        let opts = opts
            .clone()
            .with_options(&["-w", "%{http_version}\n", "-o", "/dev/null"]);

        let r = self.raw(&[url], &opts)?;
        if !r.succeeded() {
            return Ok(None);
        }

        let version = r.stdout().trim();
        if version.is_empty() {
            return Ok(None);
        }

        Ok(Some(version.to_string()))
    }
}

impl Curl<'_> {
    fn attempt(&self, url: &str, timeout: Duration) -> Option<ExecResult> {
        let opts = CurlOptions::default().with_timeout(timeout).insecure();

        match self.get(url, &opts) {
            Ok(r) => Some(r),
            Err(e) => {
                debug!("probe of {} failed: {}", url, e);
                None
            }
        }
    }
}

impl LivenessProbe for Curl<'_> {
    fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.attempt(url, timeout) {
            Some(r) => r.succeeded(),
            None => false,
        }
    }

    fn refused(&self, url: &str, timeout: Duration) -> bool {
        match self.attempt(url, timeout) {
            Some(r) => !matches!(r.exit_code(), 0 | EXIT_TIMEOUT | CURL_TIMED_OUT),
            None => false,
        }
    }
}

fn remove_stale(path: &Path) -> Result<(), io::Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
