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

use criterion::{criterion_group, criterion_main, Criterion};
use httpd_harness::response::parse_chain;
use std::hint::black_box;

fn criterion_benchmark(c: &mut Criterion) {
    const HEADER_COUNT: usize = 50;

    {
        let data = b"HTTP/2 103\r\n\
            link: </style.css>; rel=preload; as=style\r\n\
            \r\n\
            HTTP/2 103\r\n\
            link: </script.js>; rel=preload; as=script\r\n\
            \r\n\
            HTTP/2 200\r\n\
            content-type: text/html\r\n\
            content-length: 5\r\n\
            \r\n";

        c.bench_function("parse interim chain", |b| {
            b.iter(|| {
                let resp = parse_chain(black_box(data), b"hello").unwrap().unwrap();
                assert_eq!(resp.chain_len(), 3);
            })
        });
    }

    {
        let mut data = b"HTTP/1.1 200 OK\r\n".to_vec();
        for i in 0..HEADER_COUNT {
            data.extend(format!("X-Header-{i}: value {i}\r\n").as_bytes());
        }
        data.extend(b"\r\n");

        c.bench_function(&format!("parse {HEADER_COUNT} headers"), |b| {
            b.iter(|| {
                let resp = parse_chain(black_box(&data), b"").unwrap().unwrap();
                assert_eq!(resp.headers().len(), HEADER_COUNT);
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
