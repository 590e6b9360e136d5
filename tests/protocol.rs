use std::io::{Cursor, Write};

use depot::protocol::MAX_COMMAND_LENGTH;
use depot::{DepotError, ProtocolReader, ProtocolWriter, Statement};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn reader(bytes: &[u8]) -> ProtocolReader<Cursor<Vec<u8>>> {
    ProtocolReader::new(Cursor::new(bytes.to_vec()))
}

fn written(statements: &[Statement]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut writer = ProtocolWriter::new(&mut out);
        for statement in statements {
            writer.write_statement(statement).unwrap();
        }
    }
    out
}

// Reads back what the writer wrote, for payloads holding every byte but a CRLF pair
#[test]
fn frames_survive_random_payloads() {
    let mut rng = SmallRng::seed_from_u64(7);
    for _ in 0..200 {
        let len = rng.gen_range(0..300);
        let mut payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        // break up any CRLF pairs; a CR at the very end would pair with the terminator
        for i in 1..payload.len() {
            if payload[i - 1] == b'\r' && payload[i] == b'\n' {
                payload[i] = b'x';
            }
        }
        while payload.last() == Some(&b'\r') {
            payload.pop();
        }
        let statement = Statement::new("REPORT", payload);

        let bytes = written(&[statement.clone()]);
        let mut reader = reader(&bytes);
        let read = reader.read_statement().unwrap().unwrap();
        // an empty payload and no payload are the same on the wire
        assert_eq!(read, statement);
        assert!(reader.read_statement().unwrap().is_none());
    }
}

#[test]
fn lone_cr_stays_in_payload() {
    let mut reader = reader(b"PING a\rb\r\nOK\r\n");
    let ping = reader.read_statement().unwrap().unwrap();
    assert_eq!(ping.command(), b"PING");
    assert_eq!(ping.payload(), b"a\rb");
    assert_eq!(reader.read_statement().unwrap().unwrap(), Statement::command_only("OK"));
}

#[test]
fn end_of_stream_at_boundary_is_clean() {
    let mut reader = reader(b"PING hello\r\n");
    assert!(reader.read_statement().unwrap().is_some());
    assert!(reader.read_statement().unwrap().is_none());
    assert_eq!(reader.statements_read(), 1);
}

#[test]
fn end_of_stream_mid_statement_is_framing_error() {
    for partial in [&b"PING hel"[..], b"PING hello\r", b"PIN"] {
        match reader(partial).read_statement() {
            Err(DepotError::Framing(_)) => {}
            other => panic!("expected framing error for {:?}, got {:?}", partial, other),
        }
    }
}

#[test]
fn oversized_command_is_rejected() {
    for terminator in [&b" x\r\n"[..], b"\r\n"] {
        let mut bytes = vec![b'A'; MAX_COMMAND_LENGTH + 1];
        bytes.extend_from_slice(terminator);
        let err = reader(&bytes).read_statement().unwrap_err();
        assert!(err.is_fatal());
        assert!(reader(&bytes).peek_command().unwrap_err().is_fatal());
    }
}

#[test]
fn command_of_maximum_length_is_accepted() {
    let command = vec![b'A'; MAX_COMMAND_LENGTH];
    for terminator in [&b" x\r\n"[..], b"\r\n"] {
        let mut bytes = command.clone();
        bytes.extend_from_slice(terminator);

        let mut reader = reader(&bytes);
        let peeked = reader.peek_command().unwrap().unwrap();
        assert_eq!(peeked.len(), MAX_COMMAND_LENGTH);
        let read = reader.read_statement().unwrap().unwrap();
        assert_eq!(read.command(), command.as_slice());
    }

    // a lone CR after a full-length command makes it one byte too long
    let mut bytes = command;
    bytes.extend_from_slice(b"\r x\r\n");
    assert!(reader(&bytes).read_statement().is_err());
    assert!(reader(&bytes).peek_command().is_err());
}

#[test]
fn peek_and_read_agree_on_lone_cr_in_command() {
    let mut reader = reader(b"A\rB C\r\nPING\r\n");
    assert_eq!(reader.peek_command().unwrap().as_deref(), Some("A\rB"));
    let read = reader.read_statement().unwrap().unwrap();
    assert_eq!(read.command(), b"A\rB");
    assert_eq!(read.payload(), b"C");
    assert_eq!(reader.peek_command().unwrap().as_deref(), Some("PING"));
}

#[test]
fn peek_leaves_statement_in_place() {
    let mut reader = reader(b"PERMIT \"CN=a\" ping\r\nGETLOG\r\n");
    assert_eq!(reader.peek_command().unwrap().as_deref(), Some("PERMIT"));
    assert_eq!(reader.peek_command().unwrap().as_deref(), Some("PERMIT"));
    assert_eq!(reader.statements_read(), 0);

    let permit = reader.read_statement().unwrap().unwrap();
    assert_eq!(permit.payload_str(), "\"CN=a\" ping");
    assert_eq!(reader.peek_command().unwrap().as_deref(), Some("GETLOG"));
    assert!(reader.skip_statement().unwrap());
    assert_eq!(reader.peek_command().unwrap(), None);
}

#[test]
fn payload_streams_to_sink() {
    let mut reader = reader(b"OK c29tZSBkYXRh\r\nQUERYEND\r\n");
    let mut sink = Vec::new();
    let command = reader.read_statement_to(&mut sink).unwrap().unwrap();
    assert_eq!(command, b"OK".to_vec());
    assert_eq!(sink, b"c29tZSBkYXRh".to_vec());
}

#[test]
fn writer_terminates_failed_bodies() {
    let mut out = Vec::new();
    {
        let mut writer = ProtocolWriter::new(&mut out);
        let result = writer.write_with("OK", |w| {
            w.write_all(b"part")?;
            Err(DepotError::protocol("snapshot failed"))
        });
        assert!(result.is_err());
        writer.write_statement(&Statement::error("snapshot failed")).unwrap();
    }
    assert_eq!(out, b"OK part\r\nERROR snapshot failed\r\n".to_vec());
}

#[test]
fn query_results_end_with_queryend() {
    let out = {
        let mut out = Vec::new();
        let mut writer = ProtocolWriter::new(&mut out);
        writer.write_query_results(vec!["<a/>", "<b/>"]).unwrap();
        drop(writer);
        out
    };
    assert_eq!(
        out,
        b"QUERYRESULT <a/>\r\nQUERYRESULT <b/>\r\nQUERYEND\r\n".to_vec()
    );
}

#[test]
fn quoted_arguments_split() {
    use depot::protocol::{quote, split_quoted};
    assert_eq!(split_quoted("\"CN=a b\" ping"), Some(("CN=a b", "ping")));
    assert_eq!(split_quoted("'CN=\"x\"' insert "), Some(("CN=\"x\"", "insert")));
    assert_eq!(split_quoted("CN=a ping"), Some(("CN=a", "ping")));
    assert_eq!(split_quoted("\"unterminated ping"), None);
    assert_eq!(quote("CN=\"x\""), "'CN=\"x\"'");
}
