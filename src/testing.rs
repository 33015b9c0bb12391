//! An in-process stand-in for the server, used to drive the client in tests.
//! It greets, accepts any `HELLO`, records every command line it receives
//! and answers each through a caller-supplied closure.
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{
    self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
    DuplexStream,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerUrl;

/// How the fake server responds to one command.
pub(crate) enum Answer {
    Ok,
    /// Written as-is plus CRLF; may hold several lines, e.g. a bulk reply.
    Line(String),
    Silence,
    HangUp,
}

impl From<&str> for Answer {
    fn from(line: &str) -> Self {
        Answer::Line(line.to_owned())
    }
}

impl From<String> for Answer {
    fn from(line: String) -> Self {
        Answer::Line(line)
    }
}

/// The usual greeting: protocol 2, no password.
pub(crate) const HI: &str = "+HI {\"v\":2}";

/// A bulk reply carrying `body`.
pub(crate) fn bulk(body: &str) -> Answer {
    Answer::Line(format!("${}\r\n{body}", body.len()))
}

type Log = Arc<Mutex<Vec<String>>>;

pub(crate) struct ScriptedServer {
    commands: Log,
    task: JoinHandle<()>,
}

impl ScriptedServer {
    pub fn start<F>(greeting: &str, respond: F) -> (Self, DuplexStream)
    where
        F: FnMut(&str) -> Answer + Send + 'static,
    {
        greet_and_serve(greeting, "+OK", respond)
    }

    /// Serves every connection made to a local TCP port, all sharing one
    /// responder and one command log.
    pub async fn listen<F>(greeting: &str, respond: F) -> (Self, ServerUrl)
    where
        F: FnMut(&str) -> Answer + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Log::default();
        let respond = Arc::new(Mutex::new(respond));

        let greeting = greeting.to_owned();
        let log = commands.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(session(
                    socket,
                    greeting.clone(),
                    "+OK".to_owned(),
                    respond.clone(),
                    log.clone(),
                ));
            }
        });

        let url = ServerUrl::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        (Self { commands, task }, url)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Commands received starting with `verb`.
    pub fn count(&self, verb: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|line| line.starts_with(verb))
            .count()
    }

    /// Polls until `verb` has been received `n` times.
    pub async fn wait_for(&self, verb: &str, n: usize) {
        while self.count(verb) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Waits for the client to hang up.
    pub async fn finished(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Like [`ScriptedServer::start`], but answering `HELLO` with `hello_reply`.
pub(crate) fn greet_and_serve<F>(
    greeting: &str,
    hello_reply: &str,
    respond: F,
) -> (ScriptedServer, DuplexStream)
where
    F: FnMut(&str) -> Answer + Send + 'static,
{
    let (client, server) = io::duplex(64 * 1024);
    let commands = Log::default();
    let task = tokio::spawn(session(
        server,
        greeting.to_owned(),
        hello_reply.to_owned(),
        Arc::new(Mutex::new(respond)),
        commands.clone(),
    ));
    (ScriptedServer { commands, task }, client)
}

fn answer_for<F>(line: &str, hello_reply: &str, respond: &Mutex<F>) -> Answer
where
    F: FnMut(&str) -> Answer,
{
    if line.starts_with("HELLO ") {
        Answer::Line(hello_reply.to_owned())
    } else if line == "END" {
        Answer::HangUp
    } else {
        let mut respond = respond.lock();
        respond(line)
    }
}

async fn session<S, F>(
    stream: S,
    greeting: String,
    hello_reply: String,
    respond: Arc<Mutex<F>>,
    commands: Log,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&str) -> Answer,
{
    let (r, mut w) = io::split(stream);
    let mut lines = BufReader::new(r).lines();

    if write_line(&mut w, &greeting).await.is_err() {
        return;
    }

    while let Ok(Some(line)) = lines.next_line().await {
        commands.lock().push(line.clone());
        let out = match answer_for(&line, &hello_reply, &respond) {
            Answer::Ok => "+OK".to_owned(),
            Answer::Line(out) => out,
            Answer::Silence => continue,
            Answer::HangUp => return,
        };
        if write_line(&mut w, &out).await.is_err() {
            return;
        }
    }
}

async fn write_line<W>(w: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\r\n").await?;
    w.flush().await
}
