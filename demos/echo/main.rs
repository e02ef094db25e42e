//! Minimal responder: writes the request method and path back as plain
//! text. Logging is initialized once here at process start; library code
//! only ever calls into `log::*`, never sets up a logger itself.

use std::io::Write as _;

use anyhow::{anyhow, Context, Result};
use log::info;
use mosh_fcgi::{Config, Handler, Manager, Request, RingBuffer};

struct Echo;

impl Handler for Echo {
    fn response(&mut self, req: &mut Request, ring: &mut RingBuffer) -> bool {
        let method = req.env.envs.get("REQUEST_METHOD").and_then(|v| v.first());
        let path = req.env.envs.get("REQUEST_URI").and_then(|v| v.first());
        let mut body = Vec::new();
        let _ = write!(
            body,
            "Content-Type: text/plain\r\n\r\n{} {}\n",
            method.map(String::as_str).unwrap_or("?"),
            path.map(String::as_str).unwrap_or("?"),
        );
        let _ = req.out.write(ring, &body);
        true
    }
}

fn main() -> Result<()> {
    simplelog::SimpleLogger::init(simplelog::LevelFilter::Info, simplelog::Config::default())
        .map_err(|e| anyhow!("logger already initialized: {e}"))?;

    let config = Config::from_env().context("reading MOSH_FCGI_CONFIG")?;
    let listener = mosh_fcgi::init_fcgi(&config).context("not launched as a FastCGI application")?;

    let mut manager = Manager::new(listener, config, Box::new(|| Box::new(Echo) as Box<dyn Handler>))
        .context("setting up the connection manager")?;

    info!("echo-demo ready, pid {}", std::process::id());
    manager.run().context("manager loop exited with an error")
}
