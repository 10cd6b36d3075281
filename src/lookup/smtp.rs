use super::{SmtpProber, SmtpSignal};
use crate::config::NetworkConfig;
use crate::error::LookupError;
use crate::proxy::ProxyEndpoint;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// RCPT codes that mean the mailbox does not exist. Every other 5xx is
/// usually a policy block against the prober and proves nothing.
const MAILBOX_REJECT_CODES: [u16; 3] = [550, 551, 553];

#[derive(Debug, PartialEq)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

struct SmtpSession {
    stream: BufReader<TcpStream>,
}

impl SmtpSession {
    async fn read_reply(&mut self) -> Result<Reply, LookupError> {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(LookupError::Protocol("connection closed mid-reply".to_string()));
            }
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| LookupError::Protocol(format!("bad reply line: {}", line.trim_end())))?;
            let more = line.as_bytes().get(3) == Some(&b'-');
            text.push_str(line.get(4..).unwrap_or("").trim_end());
            if !more {
                return Ok(Reply { code, text });
            }
            text.push(' ');
        }
    }

    async fn command(&mut self, command: &str) -> Result<Reply, LookupError> {
        log::trace!("SMTP >> {command}");
        self.stream
            .get_mut()
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        let reply = self.read_reply().await?;
        log::trace!("SMTP << {} {}", reply.code, reply.text);
        Ok(reply)
    }
}

/// Plain-TCP RCPT prober, optionally tunnelled through an HTTP CONNECT proxy.
pub struct TcpSmtpProber {
    port: u16,
    helo_name: String,
    sender: String,
    connect_timeout: Duration,
}

impl TcpSmtpProber {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            port: config.smtp_port,
            helo_name: config.helo_name.clone(),
            sender: config.probe_sender.clone(),
            connect_timeout: Duration::from_secs(config.smtp_timeout_seconds),
        }
    }

    async fn open(
        &self,
        mail_host: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<BufReader<TcpStream>, LookupError> {
        match proxy {
            None => {
                let stream = tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect((mail_host, self.port)),
                )
                .await
                .map_err(|_| LookupError::Timeout(self.connect_timeout.as_secs()))??;
                Ok(BufReader::new(stream))
            }
            Some(proxy) => tokio::time::timeout(self.connect_timeout, self.tunnel(mail_host, proxy))
                .await
                .map_err(|_| LookupError::Proxy {
                    endpoint: proxy.to_string(),
                    reason: "CONNECT timed out".to_string(),
                })?,
        }
    }

    async fn tunnel(
        &self,
        mail_host: &str,
        proxy: &ProxyEndpoint,
    ) -> Result<BufReader<TcpStream>, LookupError> {
        let proxy_error = |reason: String| LookupError::Proxy {
            endpoint: proxy.to_string(),
            reason,
        };

        let stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
            .await
            .map_err(|e| proxy_error(e.to_string()))?;
        let mut stream = BufReader::new(stream);

        let target = format!("{mail_host}:{}", self.port);
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = proxy.basic_auth() {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream
            .get_mut()
            .write_all(request.as_bytes())
            .await
            .map_err(|e| proxy_error(e.to_string()))?;

        let mut status_line = String::new();
        stream
            .read_line(&mut status_line)
            .await
            .map_err(|e| proxy_error(e.to_string()))?;
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| proxy_error(format!("bad CONNECT reply: {}", status_line.trim_end())))?;

        // Drain the remaining response headers
        loop {
            let mut header = String::new();
            let read = stream
                .read_line(&mut header)
                .await
                .map_err(|e| proxy_error(e.to_string()))?;
            if read == 0 || header.trim_end().is_empty() {
                break;
            }
        }

        if status != 200 {
            return Err(proxy_error(format!("CONNECT refused with status {status}")));
        }
        Ok(stream)
    }
}

fn classify_rcpt(reply: &Reply) -> SmtpSignal {
    if reply.is_positive() {
        SmtpSignal::Accept
    } else if MAILBOX_REJECT_CODES.contains(&reply.code) {
        SmtpSignal::Reject
    } else {
        SmtpSignal::Neutral
    }
}

#[async_trait]
impl SmtpProber for TcpSmtpProber {
    async fn probe(
        &self,
        address: &str,
        mail_host: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<SmtpSignal, LookupError> {
        log::debug!("Starting SMTP check for {address} via {mail_host}");

        let mut session = SmtpSession {
            stream: self.open(mail_host, proxy).await?,
        };

        let greeting = session.read_reply().await?;
        if greeting.code != 220 {
            log::debug!("{mail_host} greeted with {} {}", greeting.code, greeting.text);
            return Ok(SmtpSignal::Neutral);
        }

        let ehlo = session.command(&format!("EHLO {}", self.helo_name)).await?;
        if !ehlo.is_positive() {
            let helo = session.command(&format!("HELO {}", self.helo_name)).await?;
            if !helo.is_positive() {
                return Ok(SmtpSignal::Neutral);
            }
        }

        let mail = session.command(&format!("MAIL FROM:<{}>", self.sender)).await?;
        if !mail.is_positive() {
            log::debug!("{mail_host} refused sender: {} {}", mail.code, mail.text);
            let _ = session.command("QUIT").await;
            return Ok(SmtpSignal::Neutral);
        }

        let rcpt = session.command(&format!("RCPT TO:<{address}>")).await?;
        let _ = session.command("QUIT").await;

        let signal = classify_rcpt(&rcpt);
        log::debug!(
            "RCPT for {address} on {mail_host}: {} {} -> {:?}",
            rcpt.code,
            rcpt.text,
            signal
        );
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn reply(code: u16) -> Reply {
        Reply {
            code,
            text: String::new(),
        }
    }

    #[test]
    fn test_classify_rcpt() {
        assert_eq!(classify_rcpt(&reply(250)), SmtpSignal::Accept);
        assert_eq!(classify_rcpt(&reply(251)), SmtpSignal::Accept);
        assert_eq!(classify_rcpt(&reply(550)), SmtpSignal::Reject);
        assert_eq!(classify_rcpt(&reply(553)), SmtpSignal::Reject);
        assert_eq!(classify_rcpt(&reply(554)), SmtpSignal::Neutral);
        assert_eq!(classify_rcpt(&reply(450)), SmtpSignal::Neutral);
    }

    /// Minimal scripted server: answers each command line with the next reply.
    async fn serve(listener: TcpListener, greeting: &'static str, replies: Vec<&'static str>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(greeting.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 1024];
        for reply in replies {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            socket.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    fn prober(port: u16) -> TcpSmtpProber {
        TcpSmtpProber {
            port,
            helo_name: "validator.test".to_string(),
            sender: "probe@validator.test".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_probe_accepting_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(
            listener,
            "220 mx.test ESMTP\r\n",
            vec![
                "250-mx.test\r\n250 SIZE 1000\r\n",
                "250 OK\r\n",
                "250 Accepted\r\n",
                "221 Bye\r\n",
            ],
        ));

        let signal = prober(port).probe("a@x.com", "127.0.0.1", None).await.unwrap();
        assert_eq!(signal, SmtpSignal::Accept);
    }

    #[tokio::test]
    async fn test_probe_rejecting_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(
            listener,
            "220 mx.test ESMTP\r\n",
            vec![
                "250 mx.test\r\n",
                "250 OK\r\n",
                "550 5.1.1 No such user\r\n",
                "221 Bye\r\n",
            ],
        ));

        let signal = prober(port).probe("nobody@x.com", "127.0.0.1", None).await.unwrap();
        assert_eq!(signal, SmtpSignal::Reject);
    }

    #[tokio::test]
    async fn test_probe_busy_greeting_is_neutral() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, "421 Too busy\r\n", vec![]));

        let signal = prober(port).probe("a@x.com", "127.0.0.1", None).await.unwrap();
        assert_eq!(signal, SmtpSignal::Neutral);
    }

    #[tokio::test]
    async fn test_refusing_proxy_is_a_proxy_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy = ProxyEndpoint::parse(&format!("u:p@127.0.0.1:{proxy_port}")).unwrap();
        let err = prober(25)
            .probe("a@x.com", "mx.example.com", Some(&proxy))
            .await
            .unwrap_err();
        assert!(err.is_proxy_fault());
    }
}
