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

//! Generation of server configuration for a test scenario.

use crate::env::{CredentialStore, TestEnv};
use crate::extras::{self, Extras, BASE_KEY};
use log::debug;
use std::io;
use std::path::Path;

const INDENT: &str = "  ";

#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    #[error("configuration has {0} unclosed block(s)")]
    UnclosedBlock(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Lines of text accepted by [`ConfigDocument::add`].
pub trait Lines {
    fn into_lines(self) -> Vec<String>;
}

impl Lines for &str {
    fn into_lines(self) -> Vec<String> {
        self.split('\n').map(|s| s.to_string()).collect()
    }
}

impl Lines for String {
    fn into_lines(self) -> Vec<String> {
        self.as_str().into_lines()
    }
}

impl Lines for &String {
    fn into_lines(self) -> Vec<String> {
        self.as_str().into_lines()
    }
}

impl Lines for &[&str] {
    fn into_lines(self) -> Vec<String> {
        self.iter().flat_map(|s| s.into_lines()).collect()
    }
}

impl<const N: usize> Lines for [&str; N] {
    fn into_lines(self) -> Vec<String> {
        self[..].into_lines()
    }
}

impl Lines for &[String] {
    fn into_lines(self) -> Vec<String> {
        self.iter().flat_map(|s| s.as_str().into_lines()).collect()
    }
}

impl Lines for Vec<String> {
    fn into_lines(self) -> Vec<String> {
        self[..].into_lines()
    }
}

/// Append-only configuration text with block indentation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    lines: Vec<String>,
    depth: usize,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends text, indenting every line by the current depth.
    pub fn add<L: Lines>(&mut self, lines: L) -> &mut Self {
        let prefix = INDENT.repeat(self.depth);

        for line in lines.into_lines() {
            self.lines.push(format!("{}{}", prefix, line));
        }

        self
    }

    pub fn push(&mut self) {
        self.depth += 1;
    }

    /// Leaves the innermost block. Panics if no block is open.
    pub fn pop(&mut self) {
        assert!(self.depth > 0, "no open block to close");

        self.depth -= 1;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn text(&self) -> String {
        let mut s = self.lines.join("\n");
        s.push('\n');

        s
    }
}

/// Which `Protocols` directive to add to every virtual host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolPolicy {
    Plain,
    H2,
}

/// Builds the test configuration of the server: virtual hosts, their TLS
/// setup, and any per-host extras.
pub struct HttpdConf<'a> {
    env: &'a TestEnv,
    doc: ConfigDocument,
    extras: Extras,
    protocols: ProtocolPolicy,
}

impl<'a> HttpdConf<'a> {
    pub fn new(env: &'a TestEnv, extras: Option<&Extras>) -> Self {
        Self::with_policy(env, extras.cloned().unwrap_or_default(), ProtocolPolicy::Plain)
    }

    /// Configuration for HTTP/2 tests. The CGI host gets its handler
    /// directives, and every host gets a `Protocols` line.
    pub fn h2(env: &'a TestEnv, extras: Option<&Extras>) -> Self {
        let defaults = Extras::new().with(
            env.cgi_domain(),
            vec!["SSLOptions +StdEnvVars", "AddHandler cgi-script .py"],
        );

        let extras = extras::merge(extras, Some(&defaults)).unwrap_or_default();

        Self::with_policy(env, extras, ProtocolPolicy::H2)
    }

    fn with_policy(env: &'a TestEnv, extras: Extras, protocols: ProtocolPolicy) -> Self {
        let mut conf = Self {
            env,
            doc: ConfigDocument::new(),
            extras,
            protocols,
        };

        if let Some(base) = conf.extras.get(BASE_KEY) {
            let base = base.to_vec();
            conf.doc.add(base);
        }

        conf
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.doc
    }

    pub fn lines(&self) -> &[String] {
        self.doc.lines()
    }

    pub fn add<L: Lines>(&mut self, lines: L) -> &mut Self {
        self.doc.add(lines);

        self
    }

    /// Writes the configuration to the server. Refuses a document with
    /// blocks still open.
    pub fn install(&self) -> Result<(), ConfError> {
        if self.doc.depth() != 0 {
            return Err(ConfError::UnclosedBlock(self.doc.depth()));
        }

        debug!(
            "installing {} lines to {}",
            self.doc.lines().len(),
            self.env.test_conf_path().display()
        );

        self.env.install_test_conf(self.doc.lines())?;

        Ok(())
    }

    pub fn add_certificate(&mut self, cert_file: &Path, key_file: &Path) {
        if let Some(backend) = self.env.tls_backend {
            self.doc.add(backend.certificate_directives(cert_file, key_file));
        }
    }

    /// Opens a `<VirtualHost>` block. The first domain is the server name,
    /// the others become aliases. `port` defaults to the https port. TLS is
    /// set up for the https port or when `with_ssl` is set. Extras keyed by
    /// the server name come last.
    pub fn start_vhost(
        &mut self,
        domains: &[&str],
        port: Option<u16>,
        doc_root: &str,
        with_ssl: bool,
    ) -> &mut Self {
        assert!(!domains.is_empty(), "a virtual host needs a server name");

        let port = port.unwrap_or(self.env.https_port);
        let server_name = domains[0];

        self.doc.add("");
        self.doc.add(format!("<VirtualHost *:{}>", port));
        self.doc.push();
        self.doc.add(format!("ServerName {}", server_name));
        for alias in &domains[1..] {
            self.doc.add(format!("ServerAlias {}", alias));
        }
        self.doc.add(format!("DocumentRoot {}", doc_root));

        let tls = port == self.env.https_port || with_ssl;

        if tls {
            if let Some(engine) = self.env.tls_backend.and_then(|b| b.engine_directive()) {
                self.doc.add(engine);
            }

            for cred in self.env.credentials_for_name(server_name) {
                self.add_certificate(&cred.cert_file, &cred.key_file);
            }
        }

        if let Some(extra) = self.extras.get(server_name) {
            let extra = extra.to_vec();
            self.doc.add(extra);
        }

        if self.protocols == ProtocolPolicy::H2 {
            let line = self.h2_protocols(domains, tls);
            self.doc.add(line);
        }

        self
    }

    /// Closes the innermost `<VirtualHost>`. Panics if none is open.
    pub fn end_vhost(&mut self) -> &mut Self {
        self.doc.pop();
        self.doc.add("</VirtualHost>");
        self.doc.add("");

        self
    }

    pub fn add_vhost(&mut self, domains: &[&str], port: Option<u16>, doc_root: &str) -> &mut Self {
        self.start_vhost(domains, port, doc_root, true);
        self.end_vhost()
    }

    fn h2_protocols(&self, domains: &[&str], tls: bool) -> String {
        let noh2 = format!("noh2.{}", self.env.http_tld);
        let test2 = format!("test2.{}", self.env.http_tld);

        let mut protos = if domains.contains(&noh2.as_str()) {
            vec!["http/1.1"]
        } else if tls {
            vec!["h2", "http/1.1"]
        } else {
            vec!["h2c", "http/1.1"]
        };

        if domains.contains(&test2.as_str()) {
            protos.reverse();
        }

        format!("Protocols {}", protos.join(" "))
    }

    pub fn add_proxies(&mut self, host: &str, proxy_self: bool, h2proxy_self: bool) -> &mut Self {
        let env = self.env;

        if proxy_self || h2proxy_self {
            self.doc.add("ProxyPreserveHost on");
        }
        if proxy_self {
            self.doc.add(vec![
                format!("ProxyPass /proxy/ http://127.0.0.1:{}/", env.http_port),
                format!(
                    "ProxyPassReverse /proxy/ http://{}.{}:{}/",
                    host, env.http_tld, env.http_port
                ),
            ]);
        }
        if h2proxy_self {
            self.doc.add(vec![
                format!("ProxyPass /h2proxy/ h2://127.0.0.1:{}/", env.https_port),
                format!(
                    "ProxyPassReverse /h2proxy/ https://{}.{}:{}/",
                    host, env.http_tld, env.https_port
                ),
            ]);
        }

        self
    }

    fn add_index_location(&mut self) {
        self.doc.add([
            "<Location /006>",
            "    Options +Indexes",
            "    HeaderName /006/header.html",
            "</Location>",
        ]);
    }

    /// test1 on both ports, with directory indexes and optional self proxies
    /// on the https host.
    pub fn add_vhost_test1(&mut self, proxy_self: bool, h2proxy_self: bool) -> &mut Self {
        let domain = format!("test1.{}", self.env.http_tld);
        let alias = format!("www1.{}", self.env.http_tld);
        let domains = [domain.as_str(), alias.as_str()];

        self.start_vhost(&domains, Some(self.env.http_port), "htdocs/test1", false);
        self.end_vhost();
        self.start_vhost(&domains, Some(self.env.https_port), "htdocs/test1", false);
        self.add_index_location();
        self.add_proxies("test1", proxy_self, h2proxy_self);
        self.end_vhost()
    }

    pub fn add_vhost_test2(&mut self) -> &mut Self {
        let domain = format!("test2.{}", self.env.http_tld);
        let alias = format!("www2.{}", self.env.http_tld);
        let domains = [domain.as_str(), alias.as_str()];

        self.start_vhost(&domains, Some(self.env.http_port), "htdocs/test2", false);
        self.end_vhost();
        self.start_vhost(&domains, Some(self.env.https_port), "htdocs/test2", false);
        self.add_index_location();
        self.end_vhost()
    }

    /// The CGI host on both ports. The https host also routes the h2test
    /// echo and delay handlers.
    pub fn add_vhost_cgi(&mut self, proxy_self: bool, h2proxy_self: bool) -> &mut Self {
        let domain = self.env.cgi_domain();
        let alias = format!("cgi-alias.{}", self.env.http_tld);
        let domains = [domain.as_str(), alias.as_str()];

        if proxy_self {
            self.doc.add([
                "ProxyStatus on",
                "ProxyTimeout 5",
                "SSLProxyEngine on",
                "SSLProxyVerify none",
            ]);
        }
        if h2proxy_self {
            self.doc
                .add(["SSLProxyEngine on", "SSLProxyCheckPeerName off"]);
        }

        self.start_vhost(&domains, Some(self.env.https_port), "htdocs/cgi", false);
        self.add_proxies("cgi", proxy_self, h2proxy_self);
        self.doc.add([
            "<Location \"/h2test/echo\">",
            "    SetHandler h2test-echo",
            "</Location>",
            "<Location \"/h2test/delay\">",
            "    SetHandler h2test-delay",
            "</Location>",
        ]);
        self.end_vhost();

        self.start_vhost(&domains, Some(self.env.http_port), "htdocs/cgi", false);
        self.doc.add("AddHandler cgi-script .py");
        self.add_proxies("cgi", proxy_self, h2proxy_self);
        self.end_vhost();

        self.doc
            .add(["LogLevel proxy:info", "LogLevel proxy_http:info"]);

        self
    }

    /// A host that only speaks HTTP/1.1, on both ports.
    pub fn add_vhost_noh2(&mut self) -> &mut Self {
        let domain = format!("noh2.{}", self.env.http_tld);
        let alias = format!("noh2-alias.{}", self.env.http_tld);
        let domains = [domain.as_str(), alias.as_str()];

        for port in [self.env.https_port, self.env.http_port] {
            self.start_vhost(&domains, Some(port), "htdocs/noh2", false);
            self.doc
                .add(["Protocols http/1.1", "SSLOptions +StdEnvVars"]);
            self.end_vhost();
        }

        self
    }
}

/// Server-wide directives used by the HTTP/2 tests.
pub fn h2_base_conf() -> Vec<String> {
    vec![
        "H2MinWorkers 1".to_string(),
        "H2MaxWorkers 64".to_string(),
        "Protocols h2 http/1.1 h2c".to_string(),
    ]
}

/// Extra hosts the HTTP/2 tests need certificates for.
pub fn h2_cert_domains(http_tld: &str) -> Vec<String> {
    ["push", "hints", "ssl", "pad0", "pad1", "pad2", "pad3", "pad8"]
        .iter()
        .map(|h| format!("{}.{}", h, http_tld))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::tests::test_env;
    use crate::env::TlsBackend;
    use std::fs;

    const TLD: &str = "tests.httpd.apache.org";

    fn count(lines: &[String], needle: &str) -> usize {
        lines.iter().filter(|l| l.trim() == needle).count()
    }

    #[test]
    fn document_indents_by_depth() {
        let mut doc = ConfigDocument::new();
        doc.add("<Outer>");
        doc.push();
        doc.add(["a", "b"]);
        doc.push();
        doc.add("c\nd");
        doc.pop();
        doc.pop();
        doc.add("</Outer>");

        assert_eq!(
            doc.lines(),
            &["<Outer>", "  a", "  b", "    c", "    d", "</Outer>"].map(|s| s.to_string())[..]
        );
        assert_eq!(doc.depth(), 0);
        assert_eq!(doc.text(), "<Outer>\n  a\n  b\n    c\n    d\n</Outer>\n");
    }

    #[test]
    #[should_panic(expected = "no open block")]
    fn pop_without_push_panics() {
        let mut doc = ConfigDocument::new();
        doc.pop();
    }

    #[test]
    fn single_plain_vhost() {
        let env = test_env(Path::new("/w"));
        let mut conf = HttpdConf::new(&env, None);

        conf.start_vhost(&["a.test"], Some(80), "htdocs", false);
        conf.end_vhost();

        let lines = conf.lines();
        assert_eq!(count(lines, "<VirtualHost *:80>"), 1);
        assert_eq!(count(lines, "</VirtualHost>"), 1);
        assert_eq!(count(lines, "ServerName a.test"), 1);
        assert!(!lines.iter().any(|l| l.contains("SSL")));

        let open = lines.iter().position(|l| l == "<VirtualHost *:80>").unwrap();
        let name = lines.iter().position(|l| l == "  ServerName a.test").unwrap();
        let close = lines.iter().position(|l| l == "</VirtualHost>").unwrap();
        assert!(open < name && name < close);
        assert_eq!(conf.document().depth(), 0);
    }

    #[test]
    fn tls_vhost_with_aliases() {
        let env = test_env(Path::new("/w"));
        let mut conf = HttpdConf::new(&env, None);
        let domain = format!("test1.{}", TLD);

        conf.start_vhost(&[domain.as_str(), "www1.example"], None, "htdocs/test1", false);
        conf.end_vhost();

        let lines = conf.lines();
        assert_eq!(count(lines, "<VirtualHost *:5001>"), 1);
        assert_eq!(count(lines, "ServerAlias www1.example"), 1);
        assert_eq!(count(lines, "SSLEngine on"), 1);
        assert_eq!(
            count(
                lines,
                &format!("SSLCertificateFile /w/gen/apache/ca/test1.{}.cert.pem", TLD)
            ),
            1
        );
    }

    #[test]
    fn tls_dialect_follows_backend() {
        let mut env = test_env(Path::new("/w"));
        env.tls_backend = Some(TlsBackend::Tls);
        let mut conf = HttpdConf::new(&env, None);
        let domain = format!("cgi.{}", TLD);

        conf.start_vhost(&[domain.as_str()], Some(env.http_port), "htdocs", true);
        conf.end_vhost();

        let lines = conf.lines();
        assert_eq!(count(lines, "SSLEngine on"), 0);
        assert!(lines.iter().any(|l| l.trim().starts_with("TLSCertificate ")));
    }

    #[test]
    fn extras_follow_builtin_directives() {
        let env = test_env(Path::new("/w"));
        let extras = Extras::new()
            .with("base", "LogLevel http2:debug")
            .with("a.test", vec!["DocumentRoot override", "H2Push off"])
            .with("unused.test", "NeverEmitted on");
        let mut conf = HttpdConf::new(&env, Some(&extras));

        conf.start_vhost(&["a.test"], Some(80), "htdocs", false);
        conf.end_vhost();

        let lines = conf.lines();
        assert_eq!(lines[0], "LogLevel http2:debug");

        let default_root = lines.iter().position(|l| l == "  DocumentRoot htdocs").unwrap();
        let override_root = lines
            .iter()
            .position(|l| l == "  DocumentRoot override")
            .unwrap();
        assert!(default_root < override_root);
        assert_eq!(count(lines, "H2Push off"), 1);
        assert!(!lines.iter().any(|l| l.contains("NeverEmitted")));
    }

    #[test]
    fn nested_blocks_return_to_start_depth() {
        let env = test_env(Path::new("/w"));
        let mut conf = HttpdConf::new(&env, None);

        conf.start_vhost(&["a.test"], Some(80), "htdocs", false);
        conf.start_vhost(&["b.test"], Some(81), "htdocs", false);
        assert_eq!(conf.document().depth(), 2);
        assert!(conf.lines().contains(&"    ServerName b.test".to_string()));
        conf.end_vhost();
        conf.end_vhost();

        assert_eq!(conf.document().depth(), 0);
    }

    #[test]
    #[should_panic(expected = "no open block")]
    fn end_without_start_panics() {
        let env = test_env(Path::new("/w"));
        HttpdConf::new(&env, None).end_vhost();
    }

    #[test]
    fn install_requires_closed_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path());
        fs::create_dir_all(env.server_conf_dir()).unwrap();

        let mut conf = HttpdConf::new(&env, None);
        conf.start_vhost(&["a.test"], Some(80), "htdocs", false);
        assert!(matches!(conf.install(), Err(ConfError::UnclosedBlock(1))));
        assert!(!env.test_conf_path().exists());

        conf.end_vhost();
        conf.install().unwrap();

        let text = fs::read_to_string(env.test_conf_path()).unwrap();
        assert_eq!(text.matches("<VirtualHost *:80>").count(), 1);
        assert!(text.contains("  ServerName a.test\n"));
    }

    #[test]
    fn presets_balance_blocks() {
        let env = test_env(Path::new("/w"));
        let mut conf = HttpdConf::new(&env, None);

        conf.add_vhost_test1(true, true)
            .add_vhost_test2()
            .add_vhost_cgi(true, true)
            .add_vhost(&["extra.test"], None, "htdocs");

        let lines = conf.lines();
        assert_eq!(conf.document().depth(), 0);
        assert_eq!(
            count(lines, "</VirtualHost>"),
            lines.iter().filter(|l| l.starts_with("<VirtualHost")).count()
        );
        assert_eq!(count(lines, "</VirtualHost>"), 7);
        assert_eq!(
            count(
                lines,
                &format!("ProxyPassReverse /h2proxy/ https://test1.{}:5001/", TLD)
            ),
            1
        );
        assert_eq!(count(lines, "SetHandler h2test-echo"), 1);
        assert_eq!(count(lines, "LogLevel proxy_http:info"), 1);
    }

    #[test]
    fn h2_flavor_adds_protocols_and_cgi_extras() {
        let env = test_env(Path::new("/w"));
        let user = Extras::new().with(format!("cgi.{}", TLD), "H2CopyFiles on");
        let mut conf = HttpdConf::h2(&env, Some(&user));

        conf.add_vhost_test1(false, false)
            .add_vhost_test2()
            .add_vhost_cgi(false, false)
            .add_vhost_noh2();

        let lines = conf.lines();
        assert_eq!(count(lines, "Protocols h2c http/1.1"), 2);
        assert_eq!(count(lines, "Protocols h2 http/1.1"), 2);
        assert_eq!(count(lines, "Protocols http/1.1 h2c"), 1);
        assert_eq!(count(lines, "Protocols http/1.1 h2"), 1);
        // noh2 hosts get the policy line plus their own
        assert_eq!(count(lines, "Protocols http/1.1"), 4);

        // user extras come before the defaults for the same host
        let user_pos = lines.iter().position(|l| l.trim() == "H2CopyFiles on").unwrap();
        let default_pos = lines
            .iter()
            .position(|l| l.trim() == "SSLOptions +StdEnvVars")
            .unwrap();
        assert!(user_pos < default_pos);
    }

    #[test]
    fn h2_helpers() {
        assert_eq!(h2_base_conf().len(), 3);
        assert_eq!(h2_cert_domains("t.org")[1], "hints.t.org");
    }
}
