/*
 * Copyright (C) 2023 Fastly, Inc.
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

use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "harness.conf";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Global {
    pub prefix: String,
    pub bindir: String,
    pub apxs: String,
    pub apachectl: String,
    pub curl_bin: String,
    pub nghttp: String,
    pub h2load: String,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            prefix: String::from("/usr/local/apache2"),
            bindir: String::from("/usr/local/apache2/bin"),
            apxs: String::from("apxs"),
            apachectl: String::from("apachectl"),
            curl_bin: String::from("curl"),
            nghttp: String::new(),
            h2load: String::new(),
        }
    }
}

impl From<Global> for config::ValueKind {
    fn from(global: Global) -> Self {
        let mut properties = HashMap::new();
        properties.insert("prefix".to_string(), config::Value::from(global.prefix));
        properties.insert("bindir".to_string(), config::Value::from(global.bindir));
        properties.insert("apxs".to_string(), config::Value::from(global.apxs));
        properties.insert(
            "apachectl".to_string(),
            config::Value::from(global.apachectl),
        );
        properties.insert(
            "curl_bin".to_string(),
            config::Value::from(global.curl_bin),
        );
        properties.insert("nghttp".to_string(), config::Value::from(global.nghttp));
        properties.insert("h2load".to_string(), config::Value::from(global.h2load));

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Test {
    pub http_port: u16,
    pub https_port: u16,
    pub proxy_port: u16,
    pub http_tld: String,
    pub test_dir: String,
    pub gen_dir: String,
}

impl Default for Test {
    fn default() -> Self {
        Self {
            http_port: 5002,
            https_port: 5001,
            proxy_port: 5003,
            http_tld: String::from("tests.httpd.apache.org"),
            test_dir: String::from("test"),
            gen_dir: String::from("test/gen"),
        }
    }
}

impl From<Test> for config::ValueKind {
    fn from(test: Test) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "http_port".to_string(),
            config::Value::from(test.http_port as i64),
        );
        properties.insert(
            "https_port".to_string(),
            config::Value::from(test.https_port as i64),
        );
        properties.insert(
            "proxy_port".to_string(),
            config::Value::from(test.proxy_port as i64),
        );
        properties.insert("http_tld".to_string(), config::Value::from(test.http_tld));
        properties.insert("test_dir".to_string(), config::Value::from(test.test_dir));
        properties.insert("gen_dir".to_string(), config::Value::from(test.gen_dir));

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Httpd {
    pub dso_modules: String,
    pub static_modules: String,
    // queried from apxs when empty
    pub libexecdir: String,
}

impl From<Httpd> for config::ValueKind {
    fn from(httpd: Httpd) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "dso_modules".to_string(),
            config::Value::from(httpd.dso_modules),
        );
        properties.insert(
            "static_modules".to_string(),
            config::Value::from(httpd.static_modules),
        );
        properties.insert(
            "libexecdir".to_string(),
            config::Value::from(httpd.libexecdir),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub global: Global,
    pub test: Test,
    pub httpd: Httpd,
}

impl HarnessConfig {
    pub fn new(config_file: &Path) -> Result<HarnessConfig, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(config_file).format(config::FileFormat::Ini))
            .set_default("global", Global::default())?
            .set_default("test", Test::default())?
            .set_default("httpd", Httpd::default())?
            .build()?;

        config.try_deserialize()
    }

    pub fn dso_modules(&self) -> Vec<String> {
        split_list(&self.httpd.dso_modules)
    }

    pub fn static_modules(&self) -> Vec<String> {
        split_list(&self.httpd.static_modules)
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split_whitespace().map(|s| s.to_string()).collect()
}

pub fn get_config_file(
    work_dir: &Path,
    arg_config: Option<PathBuf>,
) -> Result<PathBuf, Box<dyn Error>> {
    let mut config_files: Vec<PathBuf> = vec![];
    match arg_config {
        Some(x) => config_files.push(x),
        None => {
            // ./config
            config_files.push(work_dir.join("config").join(CONFIG_FILE_NAME));
            // working dir
            config_files.push(work_dir.join(CONFIG_FILE_NAME));
            // ./test
            config_files.push(work_dir.join("test").join(CONFIG_FILE_NAME));
        }
    }

    match config_files.iter().find(|cf| cf.is_file()) {
        Some(cf) => Ok(cf.clone()),
        None => Err(format!(
            "no configuration file found. Tried: {}",
            config_files
                .iter()
                .map(|path_buf| path_buf.display().to_string())
                .collect::<Vec<String>>()
                .join(" ")
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct TestArgs {
        name: &'static str,
        input: Option<PathBuf>,
        output: Result<PathBuf, String>,
    }

    #[test]
    fn config_file_search() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().to_path_buf();
        fs::create_dir_all(work_dir.join("test")).unwrap();
        fs::write(work_dir.join("test").join(CONFIG_FILE_NAME), "").unwrap();

        let test_args: Vec<TestArgs> = vec![
            TestArgs {
                name: "no input",
                input: None,
                output: Ok(work_dir.join("test").join(CONFIG_FILE_NAME)),
            },
            TestArgs {
                name: "invalid config file",
                input: Some(PathBuf::from("no/such/file")),
                output: Err("no configuration file found. Tried: no/such/file".to_string()),
            },
        ];

        for test_arg in test_args.iter() {
            match (
                get_config_file(&work_dir, test_arg.input.clone()),
                &test_arg.output,
            ) {
                (Ok(x), Ok(expected)) => assert_eq!(&x, expected, "{}", test_arg.name),
                (Err(e), Err(expected)) => assert_eq!(&e.to_string(), expected, "{}", test_arg.name),
                (x, _) => panic!("unexpected result for {}: {:?}", test_arg.name, x.is_ok()),
            }
        }
    }

    #[test]
    fn load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "[global]\n\
             curl_bin = /opt/curl/bin/curl\n\
             \n\
             [test]\n\
             http_port = 42001\n\
             http_tld = tests.example.org\n\
             \n\
             [httpd]\n\
             dso_modules = ssl http2 proxy\n",
        )
        .unwrap();

        let config = HarnessConfig::new(&path).unwrap();

        assert_eq!(config.global.curl_bin, "/opt/curl/bin/curl");
        assert_eq!(config.global.apachectl, "apachectl");
        assert_eq!(config.test.http_port, 42001);
        assert_eq!(config.test.https_port, 5001);
        assert_eq!(config.test.http_tld, "tests.example.org");
        assert_eq!(config.dso_modules(), vec!["ssl", "http2", "proxy"]);
        assert!(config.static_modules().is_empty());
    }
}
