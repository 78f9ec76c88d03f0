//! Flat HTTP request log.
//!
//! One line per parsed request:
//!
//! ```text
//! 02/28/26-14:03:05.123456 example.com [**] /index.html [**] curl/7.1 [**] 10.0.0.1:4000 -> 10.0.0.2:80
//! ```

use crate::config::HttpLogConfig;
use crate::output::OutputPlugin;
use crate::packet::Packet;
use crate::utils::time::Timestamp;

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};

pub struct HttpLogLogger {
    file: File,
}

impl HttpLogLogger {
    pub fn new(dir: &Path, cfg: &HttpLogConfig) -> Result<Self> {
        let path = dir.join(&cfg.filename);
        let file = File::create(&path)
            .with_context(|| format!("creating http log {}", path.display()))?;
        log::info!("opened http log {}", path.display());
        Ok(HttpLogLogger { file })
    }

    fn time_string(ts: Timestamp) -> String {
        match Utc.timestamp_opt(ts.secs as i64, 0).single() {
            Some(dt) => format!("{}.{:06}", dt.format("%m/%d/%y-%H:%M:%S"), ts.micros),
            None => format!("00/00/00-00:00:00.{:06}", ts.micros),
        }
    }
}

impl OutputPlugin for HttpLogLogger {
    fn name(&self) -> &'static str {
        "http-log"
    }

    fn log(&mut self, pkt: &Packet) -> Result<()> {
        let Some(flow) = &pkt.flow else {
            return Ok(());
        };
        // Writes every request parsed since the last packet of this flow.
        let mut state = flow.state.lock().unwrap();
        let Some(http) = state.http.as_mut() else {
            return Ok(());
        };
        if http.logged >= http.requests.len() {
            return Ok(());
        }
        let (orig, resp) = (flow.orig(), flow.resp());
        let mut lines = String::new();
        for req in &http.requests[http.logged..] {
            lines.push_str(&format!(
                "{} {} [**] {} [**] {} [**] {}:{} -> {}:{}\n",
                Self::time_string(pkt.ts),
                req.host.as_deref().unwrap_or("<hostname unknown>"),
                req.uri,
                req.user_agent.as_deref().unwrap_or("<useragent unknown>"),
                orig.ip(),
                orig.port(),
                resp.ip(),
                resp.port(),
            ));
        }
        http.logged = http.requests.len();
        drop(state);
        self.file.write_all(lines.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applayer::http::HttpState;
    use crate::config::HttpLogConfig;
    use crate::flow::table::tests::meta_packet;
    use crate::flow::FlowTable;
    use crate::output::tests::TempDir;
    use crate::utils::time::Timestamp;

    #[test]
    fn logs_one_line_per_request() {
        let tmp = TempDir::new("httplog");
        let cfg = HttpLogConfig {
            filename: "http.log".into(),
        };
        let mut logger = HttpLogLogger::new(&tmp.0, &cfg).unwrap();
        let path = tmp.0.join("http.log");

        let table = FlowTable::new(&crate::config::FlowConfig::default());
        let mut pkt = meta_packet(
            [10, 0, 0, 1],
            [10, 0, 0, 2],
            4000,
            80,
            Timestamp::new(1_600_000_000, 123_456),
        );
        table.handle_packet(&mut pkt);
        {
            let flow = pkt.flow.as_ref().unwrap();
            let mut state = flow.state.lock().unwrap();
            let mut http = HttpState::new();
            http.feed(
                b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl/7.1\r\n\r\n",
            );
            state.http = Some(http);
        }

        logger.log(&pkt).unwrap();
        // Second log call with no new requests writes nothing.
        logger.log(&pkt).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("example.com [**] /index.html [**] curl/7.1 [**]"));
        assert!(lines[0].contains("10.0.0.1:4000 -> 10.0.0.2:80"));
        assert!(lines[0].ends_with(":80"));
        assert!(lines[0].contains(".123456 "));

        pkt.flow.take().unwrap().decr_use();
    }
}
