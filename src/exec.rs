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

use crate::response::Response;
use log::{debug, error};
use serde_json::{Map, Value};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Exit code reported when the command could not be run or was killed by a
/// signal.
pub const EXIT_FAILED: i32 = -1;

/// Exit code reported when the command exceeded its time limit.
pub const EXIT_TIMEOUT: i32 = -2;

const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of running an external command, optionally enriched with the
/// parsed response chain of a probe.
pub struct ExecResult {
    args: Vec<String>,
    exit_code: i32,
    raw: Vec<u8>,
    stdout: String,
    stderr: String,
    duration: Duration,
    json: Option<Value>,
    response: Option<Response>,
    results: Map<String, Value>,
}

impl ExecResult {
    pub fn new(
        args: Vec<String>,
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        duration: Duration,
    ) -> Self {
        let json = serde_json::from_slice(&stdout).ok();

        Self {
            args,
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            raw: stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration,
            json,
            response: None,
            results: Map::new(),
        }
    }

    pub fn with_response(mut self, response: Option<Response>) -> Self {
        self.response = response;

        self
    }

    pub fn with_results(mut self, results: Map<String, Value>) -> Self {
        self.results.extend(results);

        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn outraw(&self) -> &[u8] {
        &self.raw
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Stdout decoded as JSON, if it was JSON.
    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn results(&self) -> &Map<String, Value> {
        &self.results
    }
}

impl fmt::Debug for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExecResult[code={}, args={:?}, stdout={}, stderr={}]",
            self.exit_code, self.args, self.stdout, self.stderr
        )
    }
}

/// Runs external commands on behalf of the harness.
pub trait CommandRunner {
    /// Runs `args[0]` with the remaining arguments, feeding `input` on stdin.
    /// Failures are reported through the exit code, never as an error.
    fn run(&self, args: &[String], input: Option<&[u8]>, timeout: Option<Duration>) -> ExecResult;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

fn read_all<R: Read + Send + 'static>(r: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    let mut r = r?;

    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = r.read_to_end(&mut buf) {
            debug!("failed to read command output: {}", e);
        }

        buf
    }))
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match handle {
        Some(h) => h.join().unwrap_or_default(),
        None => Vec::new(),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_FAILED)
}

fn kill_group(child: &Child) -> Result<(), io::Error> {
    let pgid = child.id() as libc::pid_t;

    // SAFETY: killpg takes no pointers. the group was created at spawn and
    // is led by a child that has not been reaped yet.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

// returns None if the deadline passed before the child exited
fn wait_until(child: &mut Child, deadline: Option<Instant>) -> Option<i32> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(exit_code(status)),
            Ok(None) => {}
            Err(e) => {
                error!("failed to wait for command: {}", e);
                return Some(EXIT_FAILED);
            }
        }

        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            thread::sleep(WAIT_INTERVAL.min(deadline - now));
        } else {
            thread::sleep(WAIT_INTERVAL);
        }
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, args: &[String], input: Option<&[u8]>, timeout: Option<Duration>) -> ExecResult {
        let start = Instant::now();

        debug!("running: {}", args.join(" "));

        let (program, rest) = match args.split_first() {
            Some(x) => x,
            None => {
                error!("no command given");
                return ExecResult::new(vec![], EXIT_FAILED, vec![], vec![], start.elapsed());
            }
        };

        let mut command = Command::new(program);
        command.args(rest);

        // own group, so a timeout also reaches anything the command spawned
        command.process_group(0);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = match command.spawn() {
            Ok(x) => x,
            Err(e) => {
                error!("failed to execute command: {}", e);
                return ExecResult::new(
                    args.to_vec(),
                    EXIT_FAILED,
                    vec![],
                    e.to_string().into_bytes(),
                    start.elapsed(),
                );
            }
        };

        let writer = match (child.stdin.take(), input) {
            (Some(mut stdin), Some(input)) => {
                let input = input.to_vec();

                Some(thread::spawn(move || {
                    // the child may exit without reading its input
                    let _ = stdin.write_all(&input);
                }))
            }
            _ => None,
        };

        let stdout = read_all(child.stdout.take());
        let stderr = read_all(child.stderr.take());

        let deadline = timeout.map(|t| start + t);

        let code = match wait_until(&mut child, deadline) {
            Some(code) => code,
            None => {
                debug!("command timed out after {:?}: {}", timeout, program);

                if let Err(e) = kill_group(&child) {
                    debug!("failed to kill command: {}", e);
                }
                let _ = child.wait();

                EXIT_TIMEOUT
            }
        };

        if let Some(w) = writer {
            let _ = w.join();
        }

        let stdout = join_output(stdout);
        let stderr = join_output(stderr);

        ExecResult::new(args.to_vec(), code, stdout, stderr, start.elapsed())
    }
}
