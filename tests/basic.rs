use httpcore::{Connection, Event, MAX_LINE_LENGTH};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn output_string(conn: &mut Connection) -> String {
    conn.take_output()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[test]
fn plain_get_keeps_connection_open() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n");

    match &events[..] {
        [Event::Headers {
            stream: 1,
            headers,
            end_stream: true,
        }, Event::End { stream: 1 }] => {
            assert_eq!(headers.get(":method"), Some("GET"));
            assert_eq!(headers.get(":path"), Some("/x"));
            assert_eq!(headers.get(":scheme"), Some("http"));
            assert_eq!(headers.get("host"), Some("a"));
        }
        other => panic!("unexpected events: {other:?}"),
    }

    let mut response = conn.respond(1).unwrap();
    response
        .status(200)
        .header("Content-Length", "2")
        .start_body()
        .body(b"OK");
    response.complete();

    assert_eq!(
        output_string(&mut conn),
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK"
    );
    assert!(!conn.wants_close());
    assert!(!conn.is_closed());
}

#[test]
fn http10_closes_after_response() {
    init();
    let mut conn = Connection::default();
    // no Host required under 1.0
    let events = conn.receive(b"GET / HTTP/1.0\r\n\r\n");
    assert!(matches!(events[0], Event::Headers { stream: 1, .. }));
    assert!(matches!(events[1], Event::End { stream: 1 }));

    let mut response = conn.respond(1).unwrap();
    response
        .status(200)
        .header("Content-Length", "5")
        .start_body()
        .body(b"hello");
    response.complete();

    let out = output_string(&mut conn);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.ends_with("hello"), "{out}");
    assert!(conn.wants_close());
}

#[test]
fn chunked_request_body_reassembled() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(
        b"POST /u HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    );

    assert!(matches!(
        events[0],
        Event::Headers {
            stream: 1,
            end_stream: false,
            ..
        }
    ));
    match &events[1] {
        Event::Body { stream: 1, data } => assert_eq!(&data[..], b"hello"),
        other => panic!("{other:?}"),
    }
    assert!(matches!(events[2], Event::End { stream: 1 }));

    let mut response = conn.respond(1).unwrap();
    response.status(204);
    response.complete();
    assert_eq!(output_string(&mut conn), "HTTP/1.1 204 No Content\r\n\r\n");
    assert!(!conn.wants_close());
}

#[test]
fn chunked_trailers_delivered() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(
        b"POST /u HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
          3\r\nabc\r\n0\r\nChecksum: ok\r\n\r\n",
    );
    match &events[..] {
        [Event::Headers { .. }, Event::Body { .. }, Event::Trailers { headers, .. }, Event::End { .. }] => {
            assert_eq!(headers.get("checksum"), Some("ok"));
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn chunk_size_supports_extensions() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(
        b"POST /u HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n3;name=x\r\nabc\r\n0\r\n\r\n",
    );
    match &events[1] {
        Event::Body { data, .. } => assert_eq!(&data[..], b"abc"),
        other => panic!("{other:?}"),
    }
}

#[test]
fn body_split_across_reads() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n12345");
    assert_eq!(events.len(), 2); // headers + first body chunk
    let events = conn.receive(b"67890");
    match &events[..] {
        [Event::Body { data, .. }, Event::End { .. }] => assert_eq!(&data[..], b"67890"),
        other => panic!("{other:?}"),
    }
}

#[test]
fn pipelined_requests_get_distinct_streams() {
    init();
    let mut conn = Connection::default();
    let events =
        conn.receive(b"GET /a HTTP/1.1\r\nHost: a\r\n\r\nGET /b HTTP/1.1\r\nHost: a\r\n\r\n");
    let streams: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Headers { stream, headers, .. } => {
                Some((*stream, headers.get(":path").unwrap().to_owned()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(streams, [(1, "/a".to_owned()), (3, "/b".to_owned())]);
}

#[test]
fn missing_host_is_400_but_connection_survives() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"GET / HTTP/1.1\r\n\r\n");
    assert!(events.is_empty());
    assert_eq!(output_string(&mut conn), "HTTP/1.1 400 Bad Request\r\n\r\n");
    assert!(!conn.wants_close());

    // next request on the same connection still works
    let events = conn.receive(b"GET /ok HTTP/1.1\r\nHost: a\r\n\r\n");
    assert!(matches!(events[0], Event::Headers { stream: 3, .. }));
}

#[test]
fn unknown_method_is_501() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"BREW /pot HTTP/1.1\r\nHost: a\r\n\r\n");
    assert!(events.is_empty());
    assert_eq!(
        output_string(&mut conn),
        "HTTP/1.1 501 Not Implemented\r\n\r\n"
    );
    assert!(!conn.wants_close());
}

#[test]
fn unknown_version_is_505_and_close() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"GET / HTTP/9.9\r\nHost: a\r\n\r\n");
    assert!(events.is_empty());
    assert!(output_string(&mut conn).starts_with("HTTP/1.1 505 "));
    assert!(conn.wants_close());
}

#[test]
fn post_without_framing_is_411() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"POST /u HTTP/1.1\r\nHost: a\r\n\r\n");
    assert!(events.is_empty());
    assert_eq!(
        output_string(&mut conn),
        "HTTP/1.1 411 Length Required\r\n\r\n"
    );
    assert!(!conn.wants_close());
}

#[test]
fn http10_post_reads_body_until_close() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"POST /u HTTP/1.0\r\n\r\nsome bytes");
    assert!(matches!(
        events[0],
        Event::Headers {
            end_stream: false,
            ..
        }
    ));
    match &events[1] {
        Event::Body { data, .. } => assert_eq!(&data[..], b"some bytes"),
        other => panic!("{other:?}"),
    }
    let events = conn.disconnected();
    assert!(matches!(events[0], Event::End { stream: 1 }));
}

#[test]
fn request_line_at_limit_is_accepted() {
    init();
    let mut conn = Connection::default();
    // "GET /aaa…a HTTP/1.1\r\n" padded so the line is exactly the cap
    let target_len = MAX_LINE_LENGTH - "GET ".len() - " HTTP/1.1\r\n".len();
    let mut request = Vec::new();
    request.extend_from_slice(b"GET /");
    request.extend_from_slice(&vec![b'a'; target_len - 1]);
    request.extend_from_slice(b" HTTP/1.1\r\nHost: a\r\n\r\n");
    let events = conn.receive(&request);
    assert!(matches!(events[0], Event::Headers { .. }));
}

#[test]
fn request_line_past_limit_is_414() {
    init();
    let mut conn = Connection::default();
    let target_len = MAX_LINE_LENGTH - "GET ".len() - " HTTP/1.1\r\n".len();
    let mut request = Vec::new();
    request.extend_from_slice(b"GET /");
    request.extend_from_slice(&vec![b'a'; target_len]); // one past the cap
    request.extend_from_slice(b" HTTP/1.1\r\n");
    let events = conn.receive(&request);
    assert!(events.is_empty());
    assert!(output_string(&mut conn).starts_with("HTTP/1.1 414 "));
    assert!(conn.wants_close());
}

#[test]
fn header_line_past_limit_is_431() {
    init();
    let mut conn = Connection::default();
    let mut request = Vec::new();
    request.extend_from_slice(b"GET / HTTP/1.1\r\nHost: a\r\nX-Big: ");
    request.extend_from_slice(&vec![b'v'; MAX_LINE_LENGTH]);
    request.extend_from_slice(b"\r\n\r\n");
    let events = conn.receive(&request);
    assert!(events.is_empty());
    assert!(output_string(&mut conn).starts_with("HTTP/1.1 431 "));
    assert!(conn.wants_close());
}

#[test]
fn folded_header_value_joined() {
    init();
    let mut conn = Connection::default();
    let events =
        conn.receive(b"GET / HTTP/1.1\r\nHost: a\r\nX-Long: first\r\n\tsecond part\r\n\r\n");
    match &events[0] {
        Event::Headers { headers, .. } => {
            assert_eq!(headers.get("x-long"), Some("first second part"));
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn encoded_word_header_decoded() {
    init();
    let mut conn = Connection::default();
    let events =
        conn.receive(b"GET / HTTP/1.1\r\nHost: a\r\nX-Name: =?ISO-8859-1?Q?Andr=E9?=\r\n\r\n");
    match &events[0] {
        Event::Headers { headers, .. } => {
            assert_eq!(headers.get("x-name"), Some("Andr\u{e9}"));
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn non_ascii_response_header_reencoded() {
    init();
    let mut conn = Connection::default();
    conn.receive(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    let mut response = conn.respond(1).unwrap();
    response.status(200).header("X-Greeting", "caf\u{e9}");
    response.complete();
    let out = output_string(&mut conn);
    assert!(out.contains("X-Greeting: =?UTF-8?B?"), "{out}");
}

#[test]
fn connection_close_token_honored() {
    init();
    let mut conn = Connection::default();
    conn.receive(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n");
    let response = conn.respond(1).unwrap();
    response.complete();
    assert!(conn.wants_close());
}

#[test]
fn content_length_zero_dispatches_immediately() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n");
    assert!(matches!(
        &events[..],
        [Event::Headers {
            end_stream: true,
            ..
        }, Event::End { .. }]
    ));
}

#[test]
fn bad_request_target_rejected() {
    init();
    let mut conn = Connection::default();
    let events = conn.receive(b"GET /\x01bad HTTP/1.1\r\nHost: a\r\n\r\n");
    assert!(events.is_empty());
    assert!(output_string(&mut conn).starts_with("HTTP/1.1 400 "));
    assert!(conn.wants_close());
}

#[test]
fn cancel_closes_http1_connection() {
    init();
    let mut conn = Connection::default();
    conn.receive(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    conn.respond(1).unwrap().cancel();
    assert!(conn.wants_close());
}

#[test]
fn websocket_sink_consumes_everything() {
    init();
    let mut conn = Connection::default();
    conn.receive(b"GET /chat HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n");
    let mut response = conn.respond(1).unwrap();
    response
        .status(101)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .start_body();
    conn.enable_websocket(1).unwrap();

    let events = conn.receive(b"\x81\x05hello");
    match &events[..] {
        [Event::WebSocketData { stream: 1, data }] => assert_eq!(&data[..], b"\x81\x05hello"),
        other => panic!("{other:?}"),
    }
    // every subsequent byte keeps flowing to the same sink
    let events = conn.receive(b"more");
    assert!(matches!(events[..], [Event::WebSocketData { stream: 1, .. }]));
}
