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

//! Inspection of the server error log.
//!
//! The log is read forward from a remembered position, so each test case
//! only sees what it caused. Errors and warnings a test provokes on purpose
//! can be marked as observed, anything else shows up in [`HttpdErrorLog::get_missed`].

use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn severity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();

    RE.get_or_init(|| {
        Regex::new(r"\[(?P<module>[^:\[\]]+):(?P<level>error|warn)\]").expect("valid regex")
    })
}

fn aplogno_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();

    RE.get_or_init(|| {
        Regex::new(r"\[[^:\[\]]+:(?:error|warn)\].* (?P<aplogno>AH\d+): .+").expect("valid regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warn,
}

pub struct HttpdErrorLog {
    path: PathBuf,
    ignored_modules: Vec<String>,
    ignored_lognos: Vec<String>,
    ignored_patterns: Vec<Regex>,
    start_pos: u64,
    last_pos: u64,
    last_errors: Vec<String>,
    last_warnings: Vec<String>,
    observed_errors: HashSet<String>,
    observed_warnings: HashSet<String>,
}

impl HttpdErrorLog {
    /// Starts watching the log at `path` from its current end.
    pub fn new(path: &Path) -> Self {
        let start_pos = fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        Self {
            path: path.to_path_buf(),
            ignored_modules: Vec::new(),
            ignored_lognos: Vec::new(),
            ignored_patterns: Vec::new(),
            start_pos,
            last_pos: start_pos,
            last_errors: Vec::new(),
            last_warnings: Vec::new(),
            observed_errors: HashSet::new(),
            observed_warnings: HashSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the log file and forgets everything seen so far.
    pub fn clear_log(&mut self) -> Result<(), io::Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        self.start_pos = 0;
        self.last_pos = 0;
        self.last_errors.clear();
        self.last_warnings.clear();
        self.observed_errors.clear();
        self.observed_warnings.clear();

        Ok(())
    }

    pub fn set_ignored_modules<S: AsRef<str>>(&mut self, modules: &[S]) {
        self.ignored_modules = modules.iter().map(|s| s.as_ref().to_string()).collect();
    }

    /// Ignores lines carrying one of the given log numbers, e.g. `AH10400`.
    pub fn set_ignored_lognos<S: AsRef<str>>(&mut self, lognos: &[S]) {
        self.ignored_lognos = lognos.iter().map(|s| s.as_ref().to_string()).collect();
    }

    /// Ignores lines matching any of `patterns` anywhere.
    pub fn set_ignored_patterns(&mut self, patterns: Vec<Regex>) {
        self.ignored_patterns = patterns;
    }

    pub fn last_errors(&self) -> &[String] {
        &self.last_errors
    }

    pub fn last_warnings(&self) -> &[String] {
        &self.last_warnings
    }

    fn is_ignored(&self, line: &str) -> bool {
        if self.ignored_patterns.iter().any(|p| p.is_match(line)) {
            return true;
        }

        match aplogno_re().captures(line) {
            Some(caps) => self.ignored_lognos.iter().any(|n| *n == caps["aplogno"]),
            None => false,
        }
    }

    fn classify(&self, line: &str) -> Option<Severity> {
        if self.is_ignored(line) {
            return None;
        }

        let caps = severity_re().captures(line)?;

        if self.ignored_modules.iter().any(|m| *m == caps["module"]) {
            return None;
        }

        match &caps["level"] {
            "error" => Some(Severity::Error),
            _ => Some(Severity::Warn),
        }
    }

    // returns the lines from pos onward and the position after them
    fn read_from(&self, pos: u64) -> Result<(Vec<String>, u64), io::Error> {
        let mut f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), pos)),
            Err(e) => return Err(e),
        };

        f.seek(SeekFrom::Start(pos))?;

        let mut data = Vec::new();
        let n = f.read_to_end(&mut data)?;

        let lines = String::from_utf8_lossy(&data)
            .lines()
            .map(|l| l.to_string())
            .collect();

        Ok((lines, pos + n as u64))
    }

    /// Collects errors and warnings logged since the last remembered
    /// position. With `advance`, the position moves to the end of the log.
    pub fn get_recent(&mut self, advance: bool) -> Result<(Vec<String>, Vec<String>), io::Error> {
        let (lines, end) = self.read_from(self.last_pos)?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for line in lines {
            match self.classify(&line) {
                Some(Severity::Error) => errors.push(line),
                Some(Severity::Warn) => warnings.push(line),
                None => {}
            }
        }

        if advance {
            self.last_pos = end;
        }

        self.observed_errors.extend(errors.iter().cloned());
        self.observed_warnings.extend(warnings.iter().cloned());

        self.last_errors = errors.clone();
        self.last_warnings = warnings.clone();

        Ok((errors, warnings))
    }

    pub fn get_recent_count(&mut self, advance: bool) -> Result<(usize, usize), io::Error> {
        let (errors, warnings) = self.get_recent(advance)?;

        Ok((errors.len(), warnings.len()))
    }

    /// Marks everything logged since the last position as expected, so it
    /// is not reported by [`get_missed`](Self::get_missed).
    pub fn ignore_recent(&mut self) -> Result<(), io::Error> {
        let (lines, end) = self.read_from(self.last_pos)?;

        for line in lines {
            match self.classify(&line) {
                Some(Severity::Error) => {
                    self.observed_errors.insert(line);
                }
                Some(Severity::Warn) => {
                    self.observed_warnings.insert(line);
                }
                None => {}
            }
        }

        self.last_errors.clear();
        self.last_warnings.clear();
        self.last_pos = end;

        Ok(())
    }

    /// Errors and warnings logged since watching began that nobody looked
    /// at.
    pub fn get_missed(&self) -> Result<(Vec<String>, Vec<String>), io::Error> {
        let (lines, _) = self.read_from(self.start_pos)?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for line in lines {
            match self.classify(&line) {
                Some(Severity::Error) if !self.observed_errors.contains(&line) => {
                    errors.push(line)
                }
                Some(Severity::Warn) if !self.observed_warnings.contains(&line) => {
                    warnings.push(line)
                }
                _ => {}
            }
        }

        Ok((errors, warnings))
    }

    /// Checks whether any line since the last position matches `pattern`.
    pub fn scan_recent(&self, pattern: &Regex) -> Result<bool, io::Error> {
        let (lines, _) = self.read_from(self.last_pos)?;

        Ok(lines.iter().any(|l| pattern.is_match(l)))
    }
}

impl fmt::Debug for HttpdErrorLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HttpdErrorLog[{}, errors: {}, warnings: {}]",
            self.path.display(),
            self.last_errors.join(" "),
            self.last_warnings.join(" ")
        )
    }
}
