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

//! Preparing the server directory for a test run.
//!
//! The source directory provides `conf/`, whose `*.template` files are
//! expanded with the environment's variables, and `htdocs/`, which is copied
//! as is.

use crate::env::TestEnv;
use log::{debug, info};
use regex::Regex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const DEFAULT_MODULES: &[&str] = &[
    "log_config",
    "logio",
    "unixd",
    "version",
    "watchdog",
    "authn_core",
    "authz_host",
    "authz_groupfile",
    "authz_user",
    "authz_core",
    "access_compat",
    "auth_basic",
    "cache",
    "cache_disk",
    "cache_socache",
    "socache_shmcb",
    "dumpio",
    "reqtimeout",
    "filter",
    "mime",
    "env",
    "headers",
    "setenvif",
    "slotmem_shm",
    "status",
    "autoindex",
    "cgid",
    "dir",
    "alias",
    "rewrite",
    "deflate",
    "proxy",
    "proxy_http",
    "proxy_balancer",
    "proxy_hcheck",
];

const TEMPLATE_SUFFIX: &str = ".template";

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("unable to find modules: {missing:?} (DSOs: {dso:?})")]
    MissingModules {
        missing: Vec<String>,
        dso: Vec<String>,
    },

    #[error("unknown template variable: {0}")]
    UnknownVariable(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();

    RE.get_or_init(|| {
        Regex::new(r"\$(?:(?P<escaped>\$)|(?P<named>[_a-zA-Z][_a-zA-Z0-9]*)|\{(?P<braced>[_a-zA-Z][_a-zA-Z0-9]*)\})")
            .expect("valid regex")
    })
}

/// Replaces `$name` and `${name}` with the value of `name`. `$$` stands for
/// a literal `$`.
pub fn expand_template(text: &str, vars: &HashMap<&str, String>) -> Result<String, SetupError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in template_re().captures_iter(text) {
        let m = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };

        out.push_str(&text[last..m.start()]);
        last = m.end();

        if caps.name("escaped").is_some() {
            out.push('$');
            continue;
        }

        let name = match caps.name("named").or_else(|| caps.name("braced")) {
            Some(n) => n.as_str(),
            None => continue,
        };

        match vars.get(name) {
            Some(v) => out.push_str(v),
            None => return Err(SetupError::UnknownVariable(name.to_string())),
        }
    }

    out.push_str(&text[last..]);

    Ok(out)
}

fn copy_dir(src: &Path, dest: &Path) -> Result<(), io::Error> {
    fs::create_dir_all(dest)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

pub struct HttpdSetup<'a> {
    env: &'a TestEnv,
    source_dir: PathBuf,
    modules: Vec<String>,
}

impl<'a> HttpdSetup<'a> {
    pub fn new(env: &'a TestEnv) -> Self {
        Self {
            env,
            source_dir: env.test_dir.clone(),
            modules: DEFAULT_MODULES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_source_dir(mut self, dir: &Path) -> Self {
        self.source_dir = dir.to_path_buf();

        self
    }

    /// Replaces the module list.
    pub fn with_modules<S: AsRef<str>>(mut self, modules: &[S]) -> Self {
        self.modules = modules.iter().map(|s| s.as_ref().to_string()).collect();

        self
    }

    pub fn add_modules<S: AsRef<str>>(mut self, modules: &[S]) -> Self {
        self.modules
            .extend(modules.iter().map(|s| s.as_ref().to_string()));

        self
    }

    /// The modules to load, with the MPM and TLS modules of the environment
    /// added if missing.
    pub fn module_names(&self) -> Vec<String> {
        let mut names = self.modules.clone();

        if !names.contains(&self.env.mpm_module) {
            names.push(self.env.mpm_module.clone());
        }

        if let Some(backend) = self.env.tls_backend {
            let name = backend.module_name().to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }

        names
    }

    /// Recreates the generated directory and populates the server
    /// directory from scratch.
    pub fn make(&self) -> Result<(), SetupError> {
        info!("setting up server in {}", self.env.server_dir.display());

        self.make_dirs()?;
        self.make_conf()?;
        self.make_modules_conf(&self.module_names())?;
        self.make_htdocs()?;

        Ok(())
    }

    fn make_dirs(&self) -> Result<(), io::Error> {
        if self.env.gen_dir.exists() {
            fs::remove_dir_all(&self.env.gen_dir)?;
        }

        fs::create_dir_all(&self.env.gen_dir)?;
        fs::create_dir_all(self.env.server_logs_dir())?;
        fs::create_dir_all(self.env.server_conf_dir())?;

        Ok(())
    }

    fn make_conf(&self) -> Result<(), SetupError> {
        let src_dir = self.source_dir.join("conf");
        if !src_dir.is_dir() {
            debug!("no configuration sources in {}", src_dir.display());
            return Ok(());
        }

        let dest_dir = self.env.server_conf_dir();
        let vars = self.env.template_vars();

        for entry in fs::read_dir(&src_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();

            match name.strip_suffix(TEMPLATE_SUFFIX) {
                Some(stem) if !stem.is_empty() => {
                    let text = fs::read_to_string(entry.path())?;
                    fs::write(dest_dir.join(stem), expand_template(&text, &vars)?)?;
                }
                _ => {
                    fs::copy(entry.path(), dest_dir.join(&name))?;
                }
            }
        }

        Ok(())
    }

    /// Writes `LoadModule` directives for every shared module. Statically
    /// built modules only get a comment.
    pub fn make_modules_conf(&self, modules: &[String]) -> Result<(), SetupError> {
        let path = self.env.server_conf_dir().join("modules.conf");
        let mut f = File::create(path)?;

        let mut missing = Vec::new();

        for m in modules {
            let mod_path = self.env.libexec_dir.join(format!("mod_{}.so", m));

            if mod_path.is_file() {
                writeln!(f, "LoadModule {}_module   \"{}\"", m, mod_path.display())?;
            } else if self.env.static_modules.contains(m) {
                writeln!(
                    f,
                    "#built static: LoadModule {}_module   \"{}\"",
                    m,
                    mod_path.display()
                )?;
            } else {
                missing.push(m.clone());
            }
        }

        if !missing.is_empty() {
            return Err(SetupError::MissingModules {
                missing,
                dso: self.env.dso_modules.clone(),
            });
        }

        Ok(())
    }

    fn make_htdocs(&self) -> Result<(), io::Error> {
        let src_dir = self.source_dir.join("htdocs");
        let dest_dir = self.env.server_docs_dir();

        if src_dir.is_dir() {
            copy_dir(&src_dir, &dest_dir)?;
        } else {
            fs::create_dir_all(&dest_dir)?;
        }

        let cgi_dir = dest_dir.join("cgi");
        if !cgi_dir.is_dir() {
            return Ok(());
        }

        for entry in fs::read_dir(&cgi_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "py").unwrap_or(false) {
                let mut perms = fs::metadata(&path)?.permissions();
                perms.set_mode(perms.mode() | 0o100);
                fs::set_permissions(&path, perms)?;
            }
        }

        Ok(())
    }
}
