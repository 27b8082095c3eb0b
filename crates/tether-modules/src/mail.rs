//! `mail`: plain SMTP delivery.
//!
//! One connection per client handle. A rejected command is an operation
//! error and leaves the connection usable; a broken connection closes the
//! handle.

use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, Table, UserDataMethods, Value};
use tether_bridge::{
    BridgeContext, BridgeError, NativeResource, ResourceHandle, ScriptMethods, ScriptObject,
    error_value, result_pair,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::options::Options;
use crate::settings::ModuleSettings;

const DEFAULT_PORT: u16 = 25;

#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }
}

/// Why an SMTP exchange failed.
#[derive(Debug)]
enum SmtpFailure {
    /// The server answered with an error code; the session is still usable.
    Rejected(Reply),
    /// The connection is gone or out of sync.
    Broken(String),
}

impl SmtpFailure {
    fn describe(&self) -> String {
        match self {
            SmtpFailure::Rejected(reply) => format!("{} {}", reply.code, reply.text),
            SmtpFailure::Broken(reason) => reason.clone(),
        }
    }

    fn into_error(self, step: &str) -> BridgeError {
        match self {
            SmtpFailure::Rejected(reply) => {
                BridgeError::operation(format!("{step} rejected: {} {}", reply.code, reply.text))
            }
            SmtpFailure::Broken(reason) => BridgeError::operation(format!("connection lost during {step}: {reason}")),
        }
    }
}

struct SmtpConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpConnection {
    async fn read_reply(&mut self) -> Result<Reply, SmtpFailure> {
        let mut text = Vec::new();
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| SmtpFailure::Broken(e.to_string()))?;
            if n == 0 {
                return Err(SmtpFailure::Broken("server closed the connection".to_string()));
            }

            let line = line.trim_end();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| SmtpFailure::Broken(format!("malformed reply '{line}'")))?;
            text.push(line.get(4..).unwrap_or("").to_string());

            // "250-..." continues, "250 ..." ends.
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(Reply {
                    code,
                    text: text.join(" "),
                });
            }
        }
    }

    async fn command(&mut self, line: &str) -> Result<Reply, SmtpFailure> {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| SmtpFailure::Broken(e.to_string()))?;
        let reply = self.read_reply().await?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(SmtpFailure::Rejected(reply))
        }
    }

    async fn data(&mut self, message: &str) -> Result<Reply, SmtpFailure> {
        let mut payload = String::with_capacity(message.len() + 8);
        for line in message.lines() {
            if line.starts_with('.') {
                payload.push('.');
            }
            payload.push_str(line);
            payload.push_str("\r\n");
        }
        payload.push_str(".\r\n");

        self.writer
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| SmtpFailure::Broken(e.to_string()))?;
        let reply = self.read_reply().await?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(SmtpFailure::Rejected(reply))
        }
    }
}

/// Values that end up on an SMTP command line or in a header must stay on
/// one line.
fn single_line(field: &str, value: &str) -> Result<(), BridgeError> {
    if value.contains(['\r', '\n']) {
        return Err(BridgeError::config(format!("{field} must not contain line breaks")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub helo: String,
    pub timeout: Duration,
}

impl MailConfig {
    fn from_table(table: &Table, settings: &ModuleSettings) -> Result<Self, BridgeError> {
        let opts = Options::new(table, "connect");
        let helo = opts.string("helo")?.unwrap_or_else(|| "localhost".to_string());
        single_line("connect.helo", &helo)?;
        Ok(Self {
            host: opts.required_string("host")?,
            port: opts.port("port")?.unwrap_or(DEFAULT_PORT),
            helo,
            timeout: opts
                .integer("timeout_ms")?
                .map(Duration::from_millis)
                .unwrap_or(settings.mail_timeout),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl Message {
    fn from_table(table: &Table) -> Result<Self, BridgeError> {
        let opts = Options::new(table, "send");
        let mut to = opts.strings("to").or_else(|_| opts.required_string("to").map(|t| vec![t]))?;
        to.retain(|t| !t.is_empty());
        if to.is_empty() {
            return Err(BridgeError::config("send.to needs at least one recipient"));
        }
        let message = Self {
            from: opts.required_string("from")?,
            to,
            subject: opts.string("subject")?.unwrap_or_default(),
            body: opts.string("body")?.unwrap_or_default(),
        };

        single_line("send.from", &message.from)?;
        for rcpt in &message.to {
            single_line("send.to", rcpt)?;
        }
        single_line("send.subject", &message.subject)?;
        Ok(message)
    }

    fn render(&self) -> String {
        format!(
            "Date: {}\r\nFrom: <{}>\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            chrono::Utc::now().to_rfc2822(),
            self.from,
            self.to.iter().map(|t| format!("<{t}>")).collect::<Vec<_>>().join(", "),
            self.subject,
            self.body
        )
    }
}

pub struct MailClient {
    server: String,
    timeout: Duration,
    conn: Arc<AsyncMutex<SmtpConnection>>,
    runtime: Handle,
}

impl NativeResource for MailClient {
    const KIND: &'static str = "mail";

    fn release(&self) -> Result<(), BridgeError> {
        let conn = self.conn.clone();
        let server = self.server.clone();
        self.runtime.spawn(async move {
            let mut conn = conn.lock().await;
            let _ = tokio::time::timeout(Duration::from_secs(1), conn.command("QUIT")).await;
            debug!(target: "mail", "Disconnected from {}", server);
        });
        Ok(())
    }
}

impl MailClient {
    pub fn connect(ctx: &BridgeContext, config: MailConfig) -> Result<Arc<ResourceHandle<MailClient>>, BridgeError> {
        let server = format!("{}:{}", config.host, config.port);
        let handshake = async {
            let stream = TcpStream::connect((config.host.as_str(), config.port))
                .await
                .map_err(|e| e.to_string())?;
            let (read, write) = stream.into_split();
            let mut conn = SmtpConnection {
                reader: BufReader::new(read),
                writer: write,
            };

            let greeting = conn.read_reply().await.map_err(|f| f.describe())?;
            if greeting.code != 220 {
                return Err(format!("unexpected greeting {} {}", greeting.code, greeting.text));
            }
            conn.command(&format!("EHLO {}", config.helo))
                .await
                .map_err(|f| format!("EHLO rejected: {}", f.describe()))?;
            Ok::<_, String>(conn)
        };

        let conn = ctx
            .block_on(async { tokio::time::timeout(config.timeout, handshake).await })
            .map_err(|_| BridgeError::connect(format!("{server}: timed out")))?
            .map_err(|e| BridgeError::connect(format!("{server}: {e}")))?;
        info!(target: "mail", "Connected to {}", server);

        Ok(ResourceHandle::new(
            ctx,
            MailClient {
                server,
                timeout: config.timeout,
                conn: Arc::new(AsyncMutex::new(conn)),
                runtime: ctx.runtime().clone(),
            },
        ))
    }

    /// Deliver one message. Returns the server's final reply text.
    async fn send(&self, message: &Message) -> Result<String, SmtpFailure> {
        let mut conn = self.conn.lock().await;
        let exchange = async {
            conn.command(&format!("MAIL FROM:<{}>", message.from)).await?;
            for rcpt in &message.to {
                conn.command(&format!("RCPT TO:<{rcpt}>")).await?;
            }
            conn.command("DATA").await?;
            conn.data(&message.render()).await
        };

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(SmtpFailure::Broken("timed out".to_string())),
        };

        match result {
            Ok(reply) => Ok(reply.text),
            Err(SmtpFailure::Rejected(reply)) => {
                // Abort the transaction so the next send starts clean.
                match tokio::time::timeout(self.timeout, conn.command("RSET")).await {
                    Ok(Err(SmtpFailure::Broken(e))) => return Err(SmtpFailure::Broken(e)),
                    Err(_) => return Err(SmtpFailure::Broken("timed out resetting after rejection".to_string())),
                    Ok(_) => {}
                }
                Err(SmtpFailure::Rejected(reply))
            }
            Err(broken) => Err(broken),
        }
    }
}

impl ScriptMethods for MailClient {
    fn add_methods<M: UserDataMethods<ScriptObject<Self>>>(methods: &mut M) {
        methods.add_method("send", |lua, this, table: Table| {
            let result = Message::from_table(&table).and_then(|message| {
                let client = this.native()?;
                let sent = this.handle().context().block_on(client.send(&message));
                match sent {
                    Ok(reply) => {
                        info!(target: "mail", "Sent '{}' to {} recipient(s)", message.subject, message.to.len());
                        Ok(reply)
                    }
                    Err(failure @ SmtpFailure::Broken(_)) => {
                        let err = failure.into_error("send");
                        this.handle().close_lost(&err.to_string());
                        Err(err)
                    }
                    Err(failure) => {
                        warn!(target: "mail", "Message to {:?} rejected", message.to);
                        Err(failure.into_error("send"))
                    }
                }
            });
            result_pair(lua, result)
        });
        methods.add_method("server", |lua, this, ()| {
            result_pair(lua, this.native().map(|c| c.server.clone()))
        });
        methods.add_method("quit", |lua, this, ()| error_value(lua, this.handle().close()));
    }
}

fn connect(lua: &Lua, table: Table) -> mlua::Result<(Value, Value)> {
    let connected = (|| {
        let ctx = BridgeContext::from_lua(lua)?;
        let config = MailConfig::from_table(&table, &ModuleSettings::from_lua(lua))?;
        MailClient::connect(&ctx, config)
    })();

    match connected {
        Ok(handle) => {
            let ud = ScriptObject::new(handle).into_userdata(lua)?;
            Ok((Value::UserData(ud), Value::Nil))
        }
        Err(e) => result_pair::<Value>(lua, Err(e)),
    }
}

pub fn load(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set("connect", lua.create_function(connect)?)?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_headers_and_body() {
        let message = Message {
            from: "a@example.com".into(),
            to: vec!["b@example.com".into(), "c@example.com".into()],
            subject: "Hi".into(),
            body: "line one\n.line two".into(),
        };
        let rendered = message.render();
        assert!(rendered.starts_with("Date: "));
        assert!(rendered.contains("From: <a@example.com>\r\n"));
        assert!(rendered.contains("To: <b@example.com>, <c@example.com>\r\n"));
        assert!(rendered.ends_with("\r\n\r\nline one\n.line two"));
    }

    #[test]
    fn test_reply_classes() {
        let ok = Reply { code: 250, text: String::new() };
        let data = Reply { code: 354, text: String::new() };
        let busy = Reply { code: 451, text: String::new() };
        let denied = Reply { code: 550, text: String::new() };
        assert!(ok.is_positive());
        assert!(data.is_positive());
        assert!(!busy.is_positive());
        assert!(!denied.is_positive());
    }
}
