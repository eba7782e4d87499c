//! Local stand-in for the ALH communicator, for tests that exercise the HTTP
//! path end to end.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;

use super::AlhWeb;

/// One query received by the communicator.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub cluster: String,
    pub method: String,
    pub resource: String,
    pub content: Option<String>,
    pub authorization: Option<String>,
    pub at: Instant,
}

type Handler = dyn Fn(&Request) -> (u16, String) + Send + 'static;

/// Answers every request with whatever `handler` returns, one connection at
/// a time, and remembers the requests in arrival order.
pub(crate) struct MockAlh {
    url: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl MockAlh {
    pub fn start(handler: impl Fn(&Request) -> (u16, String) + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/communicator", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requests);
        let handler: Box<Handler> = Box::new(handler);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                serve(stream, &log, handler.as_ref());
            }
        });

        MockAlh { url, requests }
    }

    /// Client for `cluster` that talks to this communicator directly.
    pub fn alh(&self, cluster: u16, timeout: Duration) -> AlhWeb {
        let client = Client::builder().no_proxy().timeout(timeout).build().unwrap();
        AlhWeb::with_client(client, &self.url, cluster)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn resources(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.resource).collect()
    }
}

fn serve(stream: TcpStream, log: &Mutex<Vec<Request>>, handler: &Handler) {
    let Some(request) = read_request(&stream) else {
        return;
    };
    log.lock().unwrap().push(request.clone());

    let (status, body) = handler(&request);
    let response = format!(
        "HTTP/1.1 {status} MOCK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let mut stream = stream;
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

// GET only, so the head is all there is to read.
fn read_request(stream: &TcpStream) -> Option<Request> {
    let at = Instant::now();
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let target = line.split_whitespace().nth(1)?.to_string();

    let mut authorization = None;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).ok()? == 0 || header.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("authorization") {
                authorization = Some(value.trim().to_string());
            }
        }
    }

    let (_, query) = target.split_once('?')?;
    let mut request = Request {
        cluster: String::new(),
        method: String::new(),
        resource: String::new(),
        content: None,
        authorization,
        at,
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "cluster" => request.cluster = value.into_owned(),
            "method" => request.method = value.into_owned(),
            "resource" => request.resource = value.into_owned(),
            "content" => request.content = Some(value.into_owned()),
            _ => {}
        }
    }
    Some(request)
}
