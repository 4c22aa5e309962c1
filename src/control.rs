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

//! Server lifecycle control.
//!
//! Every operation issues one control command and then polls the server
//! until it reaches the expected state or the timeout elapses. Results are
//! plain codes: 0 on success, [`ERR_CONTROL`] when the control command
//! failed, [`ERR_STATE`] when the server never reached the expected state.

use crate::env::TestEnv;
use crate::exec::CommandRunner;
use log::{debug, info, warn};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

pub const ERR_CONTROL: i32 = -1;
pub const ERR_STATE: i32 = -2;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound for a single attempt. Never more than the time left.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    Graceful,
    GracefulStop,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Graceful => "graceful",
            Self::GracefulStop => "graceful-stop",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single attempt at reaching the server.
pub trait LivenessProbe {
    /// Returns true if the server answered `url` within `timeout`.
    fn probe(&self, url: &str, timeout: Duration) -> bool;

    /// Returns true if the server was seen not answering `url`, e.g. the
    /// connection was refused. An attempt cut short by `timeout` proves
    /// nothing and must return false.
    fn refused(&self, url: &str, timeout: Duration) -> bool {
        !self.probe(url, timeout)
    }
}

pub struct ServerControl<'a> {
    env: &'a TestEnv,
    runner: &'a dyn CommandRunner,
    probe: &'a dyn LivenessProbe,
    state: ServerState,
    timeout: Duration,
    interval: Duration,
    last_stderr: String,
}

impl<'a> ServerControl<'a> {
    pub fn new(
        env: &'a TestEnv,
        runner: &'a dyn CommandRunner,
        probe: &'a dyn LivenessProbe,
    ) -> Self {
        Self {
            env,
            runner,
            probe,
            state: ServerState::Stopped,
            timeout: DEFAULT_TIMEOUT,
            interval: POLL_INTERVAL,
            last_stderr: String::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;

        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;

        self
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Probes the server once and takes the outcome as the current state.
    pub fn observe(&mut self) -> ServerState {
        let url = self.env.http_base_url();

        self.state = if self.probe.probe(&url, self.interval) {
            ServerState::Running
        } else {
            ServerState::Stopped
        };

        self.state
    }

    /// Stderr of the most recent control command.
    pub fn last_stderr(&self) -> &str {
        &self.last_stderr
    }

    pub fn control_args(&self, cmd: ControlCommand) -> Vec<String> {
        vec![
            self.env.apachectl.clone(),
            "-d".to_string(),
            self.env.server_dir.display().to_string(),
            "-f".to_string(),
            self.env.httpd_conf_path().display().to_string(),
            "-k".to_string(),
            cmd.to_string(),
        ]
    }

    fn run_control(&mut self, cmd: ControlCommand) -> i32 {
        let r = self.runner.run(&self.control_args(cmd), None, Some(self.timeout));

        self.last_stderr = r.stderr().to_string();

        if !r.succeeded() {
            warn!("{} failed: {:?}", cmd, r);
        }

        r.exit_code()
    }

    pub fn start(&mut self) -> i32 {
        info!("starting server");

        self.state = ServerState::Starting;

        if self.run_control(ControlCommand::Start) != 0 {
            self.state = ServerState::Stopped;
            return ERR_CONTROL;
        }

        self.await_live()
    }

    pub fn stop(&mut self) -> i32 {
        info!("stopping server");

        self.halt(ControlCommand::Stop)
    }

    pub fn graceful_stop(&mut self) -> i32 {
        info!("stopping server gracefully");

        self.halt(ControlCommand::GracefulStop)
    }

    /// Gracefully reloads the configuration of a running server.
    pub fn reload(&mut self) -> i32 {
        info!("reloading server");

        if self.run_control(ControlCommand::Graceful) != 0 {
            return ERR_CONTROL;
        }

        self.await_live()
    }

    /// Reloads a running server, starts one that is not.
    pub fn restart(&mut self) -> i32 {
        if self.state == ServerState::Running {
            self.reload()
        } else {
            self.start()
        }
    }

    /// Stops the server and starts it again with a fresh process.
    pub fn hard_restart(&mut self) -> i32 {
        let rv = self.stop();
        if rv == ERR_STATE {
            return rv;
        }

        // stopping a server that was not running is fine
        self.start()
    }

    /// Restarts a server expected to refuse its configuration, and succeeds
    /// only if it ends up dead.
    pub fn fail(&mut self) -> i32 {
        info!("expecting server to fail");

        self.run_control(ControlCommand::Stop);

        if self.run_control(ControlCommand::Start) != 0 {
            debug!("server refused to start");
        }

        if self.is_dead(&self.env.http_base_url(), self.timeout) {
            self.state = ServerState::Stopped;
            0
        } else {
            self.state = ServerState::Running;
            ERR_STATE
        }
    }

    fn halt(&mut self, cmd: ControlCommand) -> i32 {
        let prev = self.state;
        self.state = ServerState::Stopping;

        if self.run_control(cmd) != 0 {
            self.state = prev;
            return ERR_CONTROL;
        }

        if self.is_dead(&self.env.http_base_url(), self.timeout) {
            self.state = ServerState::Stopped;
            0
        } else {
            self.state = ServerState::Running;
            ERR_STATE
        }
    }

    fn await_live(&mut self) -> i32 {
        if self.is_live(&self.env.http_base_url(), self.timeout) {
            self.state = ServerState::Running;
            0
        } else {
            self.state = ServerState::Stopped;
            ERR_STATE
        }
    }

    /// Polls `url` until the server answers. Gives up after `timeout`.
    pub fn is_live(&self, url: &str, timeout: Duration) -> bool {
        let found = self.poll(url, timeout, true);
        if !found {
            debug!("unable to contact server after {:?}", timeout);
        }

        found
    }

    /// Polls `url` until the server stops answering. Gives up after
    /// `timeout`.
    pub fn is_dead(&self, url: &str, timeout: Duration) -> bool {
        let found = self.poll(url, timeout, false);
        if !found {
            debug!("server still responding after {:?}", timeout);
        }

        found
    }

    fn poll(&self, url: &str, timeout: Duration, want_live: bool) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let attempt = self.interval.max(ATTEMPT_TIMEOUT).min(deadline - now);

            let reached = if want_live {
                self.probe.probe(url, attempt)
            } else {
                self.probe.refused(url, attempt)
            };

            if reached {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            thread::sleep(self.interval.min(deadline - now));
        }
    }
}
