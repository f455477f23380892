//! Fake NewsBlur server for client tests.

use std::thread;

use crossbeam_channel::{unbounded, Receiver};
use tiny_http::{Header, Response, Server};

pub struct Recorded {
    pub method: String,
    pub url: String,
    pub body: String,
    pub cookie: Option<String>,
}

pub struct Canned {
    pub status: u16,
    pub body: &'static str,
    pub set_cookie: Option<&'static str>,
}

pub fn ok(body: &'static str) -> Canned {
    Canned {
        status: 200,
        body,
        set_cookie: None,
    }
}

pub fn status(status: u16, body: &'static str) -> Canned {
    Canned {
        status,
        body,
        set_cookie: None,
    }
}

pub fn with_session(body: &'static str, cookie: &'static str) -> Canned {
    Canned {
        status: 200,
        body,
        set_cookie: Some(cookie),
    }
}

/// Answers each incoming request with the next canned reply, in order.
/// Returns the base url and a feed of the requests as they were received.
pub fn serve(replies: Vec<Canned>) -> (String, Receiver<Recorded>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let base = format!("http://{}/", server.server_addr());
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for reply in replies {
            let Ok(mut request) = server.recv() else {
                return;
            };
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let cookie = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Cookie"))
                .map(|h| h.value.as_str().to_string());
            let _ = tx.send(Recorded {
                method: request.method().to_string(),
                url: request.url().to_string(),
                body,
                cookie,
            });
            let mut response = Response::from_string(reply.body)
                .with_status_code(reply.status)
                .with_header(
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
                );
            if let Some(cookie) = reply.set_cookie {
                response = response
                    .with_header(Header::from_bytes(&b"Set-Cookie"[..], cookie.as_bytes()).unwrap());
            }
            let _ = request.respond(response);
        }
    });
    (base, rx)
}
