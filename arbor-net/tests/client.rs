//! Client behavior against a scripted server: argument encoding,
//! interpret mode, error surfacing and session reuse.

use std::net::TcpListener;
use std::thread::{self, JoinHandle};

use arbor_net::{read_frame, write_frame, Client, ClientError};

/// Serve canned replies and record every request payload. Each element
/// of `replies` answers one frame; connections are re-accepted as the
/// client reconnects. When `drop_after_each` is set the connection is
/// closed after every reply to force reconnects.
fn scripted_server(
    replies: Vec<&'static str>,
    drop_after_each: bool,
) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let mut received = Vec::new();
        let mut replies = replies.into_iter();
        let mut next = replies.next();

        while next.is_some() {
            let (mut stream, _) = listener.accept().unwrap();
            loop {
                match read_frame(&mut stream) {
                    Ok(Some(payload)) => {
                        received.push(payload);
                        let reply = match next.take() {
                            Some(reply) => reply,
                            None => break,
                        };
                        write_frame(&mut stream, reply).unwrap();
                        next = replies.next();
                        if drop_after_each {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            if next.is_none() {
                break;
            }
        }
        received
    });

    (port, handle)
}

fn to_args(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

#[test]
fn query_joins_arguments_with_newlines() {
    let (port, server) = scripted_server(vec!["ok\n"], false);
    let client = Client::localhost(port);

    let lines = client.query(&to_args(&["a", "b", "c"])).unwrap();
    assert_eq!(lines, vec!["ok"]);

    client.close();
    assert_eq!(server.join().unwrap(), vec!["a\nb\nc"]);
}

#[test]
fn interpret_mode_appends_edit_and_parses_json() {
    let (port, server) = scripted_server(vec!["{\n    \"k\": \"v\"\n}\n"], false);
    let client = Client::localhost(port);

    let value = client.get(&["key"]).unwrap();
    assert_eq!(value, Some(serde_json::json!({"k": "v"})));

    client.close();
    assert_eq!(server.join().unwrap(), vec!["key\n--edit"]);
}

#[test]
fn set_serializes_the_value_as_json() {
    let (port, server) = scripted_server(vec!["\n"], false);
    let client = Client::localhost(port);

    client
        .set(&["config"], &serde_json::json!({"a": "b"}))
        .unwrap();

    client.close();
    assert_eq!(server.join().unwrap(), vec!["config\n--set\n{\"a\":\"b\"}"]);
}

#[test]
fn error_replies_surface_as_database_errors() {
    let (port, server) = scripted_server(vec!["error: cannot append to a mapping\n"], false);
    let client = Client::localhost(port);

    let err = client.query(&to_args(&["x", "+", "y"])).unwrap_err();
    match err {
        ClientError::Db(line) => assert_eq!(line, "error: cannot append to a mapping"),
        other => panic!("expected a database error, got {other:?}"),
    }

    client.close();
    server.join().unwrap();
}

#[test]
fn empty_replies_mean_no_lines_and_no_value() {
    let (port, server) = scripted_server(vec!["\n", "{}\n"], false);
    let client = Client::localhost(port);

    assert_eq!(client.query(&to_args(&["k", "=", "v"])).unwrap(), Vec::<String>::new());
    // an absent key renders as an empty mapping, which get() reads as None
    assert_eq!(client.get(&["missing"]).unwrap(), None);

    client.close();
    server.join().unwrap();
}

#[test]
fn pop_returns_the_first_reply_line() {
    let (port, server) = scripted_server(vec!["tail\n"], false);
    let client = Client::localhost(port);

    assert_eq!(client.pop(&["xs"]).unwrap(), Some("tail".to_string()));

    client.close();
    assert_eq!(server.join().unwrap(), vec!["xs\n--pop"]);
}

#[test]
fn a_dropped_session_reconnects_on_the_next_query() {
    let (port, server) = scripted_server(vec!["one\n", "two\n"], true);
    let client = Client::localhost(port);

    assert_eq!(client.query(&to_args(&["first"])).unwrap(), vec!["one"]);
    // the server hung up after replying; the next query reconnects
    assert_eq!(client.query(&to_args(&["second"])).unwrap(), vec!["two"]);

    client.close();
    assert_eq!(server.join().unwrap(), vec!["first", "second"]);
}

#[test]
fn keys_helper_appends_the_operator() {
    let (port, server) = scripted_server(vec!["a\nb\n"], false);
    let client = Client::localhost(port);

    assert_eq!(client.keys(&["dict"]).unwrap(), vec!["a", "b"]);

    client.close();
    assert_eq!(server.join().unwrap(), vec!["dict\n--keys"]);
}
