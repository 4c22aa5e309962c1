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

//! The run environment shared by all harness components.
//!
//! A [`TestEnv`] is assembled once per test run, from the harness
//! configuration file plus a few environment variables, and is then only
//! ever handed out by shared reference.

use crate::core::config::HarnessConfig;
use crate::exec::CommandRunner;
use std::collections::HashMap;
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const SERVER_ADDR: &str = "127.0.0.1";

/// The TLS module of the server under test. Each one spells certificate
/// configuration differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsBackend {
    /// mod_ssl
    Ssl,
    /// mod_tls
    Tls,
}

impl TlsBackend {
    pub fn from_module_name(name: &str) -> Option<Self> {
        match name.trim() {
            "ssl" => Some(Self::Ssl),
            "tls" => Some(Self::Tls),
            _ => None,
        }
    }

    pub fn module_name(&self) -> &'static str {
        match self {
            Self::Ssl => "ssl",
            Self::Tls => "tls",
        }
    }

    /// Directive that must precede certificates in a host block, if any.
    pub fn engine_directive(&self) -> Option<&'static str> {
        match self {
            Self::Ssl => Some("SSLEngine on"),
            Self::Tls => None,
        }
    }

    pub fn certificate_directives(&self, cert_file: &Path, key_file: &Path) -> Vec<String> {
        match self {
            Self::Ssl => vec![
                format!("SSLCertificateFile {}", cert_file.display()),
                format!("SSLCertificateKeyFile {}", key_file.display()),
            ],
            Self::Tls => vec![format!(
                "TLSCertificate {} {}",
                cert_file.display(),
                key_file.display()
            )],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// A set of domains sharing one certificate. The first domain names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertSpec {
    pub domains: Vec<String>,
}

impl CertSpec {
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        Self {
            domains: domains.iter().map(|d| d.as_ref().to_string()).collect(),
        }
    }
}

pub trait CredentialStore {
    fn credentials_for_name(&self, domain: &str) -> Vec<Credentials>;
}

#[derive(Debug, Clone)]
pub struct TestEnv {
    pub prefix: PathBuf,
    pub apxs: String,
    pub apachectl: String,
    pub curl: String,
    pub nghttp: String,
    pub h2load: String,
    pub http_port: u16,
    pub https_port: u16,
    pub proxy_port: u16,
    pub http_tld: String,
    pub test_dir: PathBuf,
    pub gen_dir: PathBuf,
    pub server_dir: PathBuf,
    pub libexec_dir: PathBuf,
    pub dso_modules: Vec<String>,
    pub static_modules: Vec<String>,
    pub mpm_module: String,
    pub tls_backend: Option<TlsBackend>,
    pub base_conf: Vec<String>,
    pub ca_dir: PathBuf,
    pub cert_specs: Vec<CertSpec>,
}

impl TestEnv {
    /// Builds the environment from the harness configuration. The `SSL` and
    /// `MPM` environment variables select the TLS backend and MPM module.
    pub fn new(config: &HarnessConfig, work_dir: &Path) -> Self {
        let ssl = env::var("SSL").ok();
        let mpm = env::var("MPM").ok();

        Self::with_modules(config, work_dir, ssl.as_deref(), mpm.as_deref())
    }

    pub fn with_modules(
        config: &HarnessConfig,
        work_dir: &Path,
        ssl: Option<&str>,
        mpm: Option<&str>,
    ) -> Self {
        let gen_dir = work_dir.join(&config.test.gen_dir);
        let server_dir = gen_dir.join("apache");
        let http_tld = config.test.http_tld.clone();

        let tls_backend = match ssl {
            None => Some(TlsBackend::Ssl),
            Some(s) => TlsBackend::from_module_name(s),
        };

        let cert_specs = vec![CertSpec::new(&[
            format!("test1.{}", http_tld),
            format!("test2.{}", http_tld),
            format!("test3.{}", http_tld),
            format!("cgi.{}", http_tld),
        ])];

        Self {
            prefix: PathBuf::from(&config.global.prefix),
            apxs: config.global.apxs.clone(),
            apachectl: config.global.apachectl.clone(),
            curl: config.global.curl_bin.clone(),
            nghttp: config.global.nghttp.clone(),
            h2load: config.global.h2load.clone(),
            http_port: config.test.http_port,
            https_port: config.test.https_port,
            proxy_port: config.test.proxy_port,
            http_tld,
            test_dir: work_dir.join(&config.test.test_dir),
            libexec_dir: PathBuf::from(&config.httpd.libexecdir),
            dso_modules: config.dso_modules(),
            static_modules: config.static_modules(),
            mpm_module: format!("mpm_{}", mpm.unwrap_or("event")),
            tls_backend,
            base_conf: vec![],
            ca_dir: server_dir.join("ca"),
            cert_specs,
            gen_dir,
            server_dir,
        }
    }

    pub fn add_base_conf<S: AsRef<str>>(mut self, lines: &[S]) -> Self {
        self.base_conf
            .extend(lines.iter().map(|s| s.as_ref().to_string()));

        self
    }

    pub fn add_cert_specs(mut self, specs: Vec<CertSpec>) -> Self {
        self.cert_specs.extend(specs);

        self
    }

    /// Adds a `LogLevel` line raising the given modules to the level that
    /// matches the harness verbosity.
    pub fn add_log_modules<S: AsRef<str>>(self, modules: &[S], verbosity: u8) -> Self {
        if modules.is_empty() {
            return self;
        }

        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace2",
        };

        let mut line = String::from("LogLevel");
        for m in modules {
            line.push_str(&format!(" {}:{}", m.as_ref(), level));
        }

        self.add_base_conf(&[line])
    }

    pub fn http_base_url(&self) -> String {
        format!("http://{}:{}", SERVER_ADDR, self.http_port)
    }

    pub fn https_base_url(&self) -> String {
        format!("https://{}:{}", SERVER_ADDR, self.https_port)
    }

    pub fn server_conf_dir(&self) -> PathBuf {
        self.server_dir.join("conf")
    }

    pub fn server_docs_dir(&self) -> PathBuf {
        self.server_dir.join("htdocs")
    }

    pub fn server_logs_dir(&self) -> PathBuf {
        self.server_dir.join("logs")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.server_logs_dir().join("error_log")
    }

    pub fn access_log_path(&self) -> PathBuf {
        self.server_logs_dir().join("access_log")
    }

    pub fn httpd_conf_path(&self) -> PathBuf {
        self.server_conf_dir().join("httpd.conf")
    }

    pub fn test_conf_path(&self) -> PathBuf {
        self.server_conf_dir().join("test.conf")
    }

    /// The side-channel file curl dumps response headers into.
    pub fn curl_headerfile(&self) -> PathBuf {
        self.gen_dir.join("curl.headers")
    }

    pub fn ca_cert_file(&self) -> PathBuf {
        self.ca_dir.join("ca.pem")
    }

    pub fn cgi_domain(&self) -> String {
        format!("cgi.{}", self.http_tld)
    }

    pub fn has_nghttp(&self) -> bool {
        !self.nghttp.is_empty()
    }

    pub fn has_h2load(&self) -> bool {
        !self.h2load.is_empty()
    }

    pub fn mkurl(&self, scheme: &str, hostname: &str, path: &str) -> String {
        let port = if scheme == "https" {
            self.https_port
        } else {
            self.http_port
        };

        format!("{}://{}.{}:{}{}", scheme, hostname, self.http_tld, port, path)
    }

    /// Writes the server-wide base configuration followed by `lines` as the
    /// test configuration, replacing whatever was installed before.
    pub fn install_test_conf(&self, lines: &[String]) -> Result<(), io::Error> {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.test_conf_path())?;

        writeln!(f, "{}", self.base_conf.join("\n"))?;
        writeln!(f, "{}", lines.join("\n"))?;

        Ok(())
    }

    pub fn apxs_var(&self, runner: &dyn CommandRunner, name: &str) -> String {
        let args = vec![self.apxs.clone(), "-q".to_string(), name.to_string()];

        let r = runner.run(&args, None, None);
        if !r.succeeded() {
            return String::new();
        }

        r.stdout().trim().to_string()
    }

    pub fn httpd_version(&self, runner: &dyn CommandRunner) -> String {
        let v = self.apxs_var(runner, "HTTPD_VERSION");

        if v.is_empty() {
            "unknown".to_string()
        } else {
            v
        }
    }

    /// Values available to configuration templates.
    pub fn template_vars(&self) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();

        vars.insert("prefix", self.prefix.display().to_string());
        vars.insert("http_port", self.http_port.to_string());
        vars.insert("https_port", self.https_port.to_string());
        vars.insert("proxy_port", self.proxy_port.to_string());
        vars.insert("http_tld", self.http_tld.clone());
        vars.insert("http_addr", SERVER_ADDR.to_string());
        vars.insert("http_base_url", self.http_base_url());
        vars.insert("https_base_url", self.https_base_url());
        vars.insert("test_dir", self.test_dir.display().to_string());
        vars.insert("gen_dir", self.gen_dir.display().to_string());
        vars.insert("server_dir", self.server_dir.display().to_string());
        vars.insert("server_conf_dir", self.server_conf_dir().display().to_string());
        vars.insert("server_docs_dir", self.server_docs_dir().display().to_string());
        vars.insert("server_logs_dir", self.server_logs_dir().display().to_string());
        vars.insert("libexec_dir", self.libexec_dir.display().to_string());
        vars.insert("mpm_module", self.mpm_module.clone());
        vars.insert(
            "ssl_module",
            self.tls_backend
                .map(|b| b.module_name().to_string())
                .unwrap_or_default(),
        );

        vars
    }
}

impl CredentialStore for TestEnv {
    fn credentials_for_name(&self, domain: &str) -> Vec<Credentials> {
        for spec in &self.cert_specs {
            if spec.domains.iter().any(|d| d == domain) {
                let name = &spec.domains[0];

                return vec![Credentials {
                    cert_file: self.ca_dir.join(format!("{}.cert.pem", name)),
                    key_file: self.ca_dir.join(format!("{}.pkey.pem", name)),
                }];
            }
        }

        vec![]
    }
}
