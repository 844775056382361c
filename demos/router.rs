//! A small routed server with shared state.
//!
//! Run with `RUST_LOG=debug cargo run --example router` and try:
//! - `curl http://127.0.0.1:3000/`
//! - `curl http://127.0.0.1:3000/hello/your-name`
//! - `curl http://127.0.0.1:3000/counter` (increments on each visit)
//! - `curl -d 'some text' http://127.0.0.1:3000/echo`
//! - `curl http://127.0.0.1:3000/stream`
//! - `curl http://127.0.0.1:3000/countdown` (one line per second)

use evhttp::{Exchange, Method, Server, ServerConfig, ServerError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig { port: 3000, ..ServerConfig::new()? };
    let counter = Arc::new(AtomicUsize::new(0));

    Server::with_config(config)
        .route("/", |exchange: &mut Exchange<'_>| {
            exchange.send_reply(200, "OK", Some(b"Welcome to evhttp!"));
        })
        .route("/hello/*", |exchange: &mut Exchange<'_>| {
            let name = exchange.request().path().trim_start_matches("/hello/").to_string();
            let name = if name.is_empty() { "world".to_string() } else { name };
            exchange.send_reply(200, "OK", Some(format!("Hello, {}!", name).as_bytes()));
        })
        .route("/counter", move |exchange: &mut Exchange<'_>| {
            let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
            exchange.send_reply(200, "OK", Some(format!("Counter: {}", count).as_bytes()));
        })
        .route("/echo", |exchange: &mut Exchange<'_>| {
            if exchange.request().method() != &Method::Post {
                exchange.send_error(405, "Method Not Allowed");
                return;
            }
            let body = exchange.request().body().as_bytes().to_vec();
            exchange
                .request_mut()
                .output_headers_mut()
                .insert("Content-Type", "application/octet-stream");
            exchange.send_reply(200, "OK", Some(&body));
        })
        .route("/stream", |exchange: &mut Exchange<'_>| {
            exchange.send_reply_start(200, "OK");
            for i in 1..=5 {
                exchange.send_reply_chunk(format!("chunk {}\n", i).as_bytes());
            }
            exchange.send_reply_end();
        })
        .route("/countdown", |exchange: &mut Exchange<'_>| {
            exchange.send_reply_start(200, "OK");
            let mut reply = exchange.defer();
            thread::spawn(move || {
                for i in (1..=3).rev() {
                    reply.send_reply_chunk(format!("{}...\n", i).as_bytes());
                    thread::sleep(Duration::from_secs(1));
                }
                reply.send_reply_chunk(b"liftoff\n");
                reply.send_reply_end();
            });
        })
        .start()
}
