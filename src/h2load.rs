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

use crate::exec::ExecResult;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

pub const RESULTS_KEY: &str = "h2load";

fn requests_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();

    RE.get_or_init(|| {
        Regex::new(
            r"requests: (\d+) total, (\d+) started, (\d+) done, (\d+) succeeded, (\d+) failed, (\d+) errored, (\d+) timeout",
        )
        .expect("valid regex")
    })
}

fn status_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();

    RE.get_or_init(|| {
        Regex::new(r"status codes: (\d+) 2xx, (\d+) 3xx, (\d+) 4xx, (\d+) 5xx").expect("valid regex")
    })
}

fn numbers(caps: &regex::Captures, count: usize) -> Option<Vec<u64>> {
    (1..=count)
        .map(|i| caps.get(i).and_then(|m| m.as_str().parse().ok()))
        .collect()
}

/// Extracts the request summary from h2load output. Returns `None` if the
/// output has no summary, e.g. because h2load failed early.
pub fn parse_stats(stdout: &str) -> Option<Value> {
    let caps = requests_re().captures(stdout)?;
    let n = numbers(&caps, 7)?;

    let mut stats = Map::new();
    stats.insert(
        "requests".to_string(),
        json!({
            "total": n[0],
            "started": n[1],
            "done": n[2],
            "succeeded": n[3],
            "failed": n[4],
            "errored": n[5],
            "timeout": n[6],
        }),
    );

    if let Some(caps) = status_re().captures(stdout) {
        if let Some(s) = numbers(&caps, 4) {
            stats.insert(
                "status".to_string(),
                json!({
                    "2xx": s[0],
                    "3xx": s[1],
                    "4xx": s[2],
                    "5xx": s[3],
                }),
            );
        }
    }

    Some(Value::Object(stats))
}

/// Attaches the statistics of an h2load run to its result.
pub fn with_stats(result: ExecResult) -> ExecResult {
    let stats = match parse_stats(result.stdout()) {
        Some(stats) => stats,
        None => return result,
    };

    let mut results = Map::new();
    results.insert(RESULTS_KEY.to_string(), stats);

    result.with_results(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const OUTPUT: &str = "starting benchmark...
spawning thread #0: 1 total client(s). 1000 total requests
TLS Protocol: TLSv1.3
Application protocol: h2
progress: 10% done
progress: 100% done

finished in 1.02s, 980.39 req/s, 1.02MB/s
requests: 1000 total, 1000 started, 998 done, 995 succeeded, 5 failed, 2 errored, 0 timeout
status codes: 995 2xx, 0 3xx, 3 4xx, 0 5xx
traffic: 1.02MB (1069000) total, 3.91KB (4000) headers (space savings 95.00%), 976.56KB (1000000) data
";

    #[test]
    fn parse_summary() {
        let stats = parse_stats(OUTPUT).unwrap();

        assert_eq!(stats["requests"]["total"], 1000);
        assert_eq!(stats["requests"]["done"], 998);
        assert_eq!(stats["requests"]["succeeded"], 995);
        assert_eq!(stats["requests"]["errored"], 2);
        assert_eq!(stats["status"]["2xx"], 995);
        assert_eq!(stats["status"]["4xx"], 3);
    }

    #[test]
    fn no_summary() {
        assert!(parse_stats("connect to 127.0.0.1 failed\n").is_none());
    }

    #[test]
    fn attach_to_result() {
        let r = ExecResult::new(
            vec!["h2load".to_string()],
            0,
            OUTPUT.as_bytes().to_vec(),
            vec![],
            Duration::ZERO,
        );

        let r = with_stats(r);
        assert_eq!(r.results()[RESULTS_KEY]["status"]["5xx"], 0);

        let r = ExecResult::new(vec![], 1, vec![], vec![], Duration::ZERO);
        assert!(with_stats(r).results().is_empty());
    }
}
