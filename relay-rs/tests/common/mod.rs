//! Scripted smart host for integration tests

#![allow(dead_code)]

use relay_rs::relay::RelayTransaction;
use relay_rs::trace::TraceLog;
use relay_rs::transport::SmtpTransportFactory;
use relay_rs::Settings;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const MESSAGE: &[u8] = b"From: App <app@example.com>\r\n\
To: ops@example.org\r\n\
Bcc: audit@example.org\r\n\
Subject: Disk usage\r\n\
\r\n\
CONFIDENTIAL-BODY-TEXT\r\n\
.starts with a dot\r\n";

/// How the scripted smart host answers
#[derive(Clone)]
pub struct Script {
    pub extensions: Vec<&'static str>,
    pub rcpt_reply: &'static str,
    pub greet: bool,
    pub ehlo: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            extensions: vec!["8BITMIME", "AUTH PLAIN LOGIN"],
            rcpt_reply: "250 2.1.5 OK",
            greet: true,
            ehlo: true,
        }
    }
}

pub struct SmartHost {
    pub addr: SocketAddr,
    /// Every line the client sent; DATA lines are prefixed with `DATA: `
    pub transcript: JoinHandle<Vec<String>>,
}

/// Serve exactly one SMTP conversation on a loopback port
pub async fn smart_host(script: Script) -> SmartHost {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let transcript = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);
        let mut seen = Vec::new();

        if !script.greet {
            // hold the connection open without a greeting
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
            return seen;
        }

        write.write_all(b"220 mock.example ESMTP\r\n").await.unwrap();

        let mut line = String::new();
        let mut login_steps = 0;
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let cmd = line.trim_end().to_string();
            seen.push(cmd.clone());
            let verb = cmd.split_whitespace().next().unwrap_or("").to_ascii_uppercase();

            if login_steps > 0 {
                login_steps -= 1;
                let reply: &[u8] = if login_steps > 0 {
                    b"334 UGFzc3dvcmQ6\r\n"
                } else {
                    b"235 2.7.0 Authentication successful\r\n"
                };
                write.write_all(reply).await.unwrap();
                continue;
            }

            let reply = match verb.as_str() {
                "EHLO" if !script.ehlo => "502 5.5.1 EHLO not supported\r\n".to_string(),
                "HELO" => "250 mock.example\r\n".to_string(),
                "AUTH" if cmd.eq_ignore_ascii_case("AUTH LOGIN") => {
                    login_steps = 2;
                    "334 VXNlcm5hbWU6\r\n".to_string()
                }
                "EHLO" => {
                    let mut reply = String::from("250-mock.example\r\n");
                    for (i, ext) in script.extensions.iter().enumerate() {
                        let sep = if i + 1 == script.extensions.len() { ' ' } else { '-' };
                        reply.push_str(&format!("250{}{}\r\n", sep, ext));
                    }
                    if script.extensions.is_empty() {
                        reply = String::from("250 mock.example\r\n");
                    }
                    reply
                }
                "AUTH" => "235 2.7.0 Authentication successful\r\n".to_string(),
                "MAIL" => "250 2.1.0 OK\r\n".to_string(),
                "RCPT" => format!("{}\r\n", script.rcpt_reply),
                "DATA" => {
                    write.write_all(b"354 Go ahead\r\n").await.unwrap();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return seen;
                        }
                        let data = line.trim_end_matches(['\r', '\n']);
                        if data == "." {
                            break;
                        }
                        seen.push(format!("DATA: {}", data));
                    }
                    "250 2.0.0 Queued as MOCK1\r\n".to_string()
                }
                "QUIT" => {
                    let _ = write.write_all(b"221 2.0.0 Bye\r\n").await;
                    break;
                }
                _ => "502 5.5.1 Unrecognized command\r\n".to_string(),
            };
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }

        seen
    });

    SmartHost { addr, transcript }
}

pub fn settings_for(addr: SocketAddr) -> Settings {
    Settings {
        smart_host: addr.ip().to_string(),
        smart_host_port: addr.port(),
        use_start_tls: true,
        allowed_ips: vec!["127.0.0.1".to_string(), "10.0.0.0/8".to_string()],
        ..Settings::default()
    }
}

pub fn factory(timeout: Duration) -> SmtpTransportFactory {
    SmtpTransportFactory::new()
        .with_helo_name("relay.test")
        .with_timeouts(timeout, timeout)
}

pub fn relay(settings: Settings, log_dir: &Path, timeout: Duration) -> RelayTransaction {
    RelayTransaction::new(
        Arc::new(settings),
        Arc::new(TraceLog::new(log_dir)),
        Arc::new(factory(timeout)),
    )
}

/// Content of the single trace file in `dir`
pub fn trace_content(dir: &Path) -> String {
    let files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .collect();
    assert_eq!(files.len(), 1, "expected one trace file, got {:?}", files);
    std::fs::read_to_string(&files[0]).unwrap()
}
