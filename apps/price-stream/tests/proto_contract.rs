//! Proto Contract Tests
//!
//! The message and service types are checked in under
//! `src/infrastructure/grpc/proto/`. These tests read `price.proto` and fail
//! when the checked-in code no longer matches its messages, fields, tags or
//! RPCs, so a proto edit cannot land without regenerating the code.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;

struct Field {
    name: String,
    scalar: String,
    repeated: bool,
    tag: u32,
}

struct Message {
    name: String,
    fields: Vec<Field>,
}

struct Rpc {
    name: String,
    server_streaming: bool,
}

struct Contract {
    package: String,
    service: String,
    messages: Vec<Message>,
    rpcs: Vec<Rpc>,
}

fn read(relative: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
}

/// Minimal proto3 reader covering the constructs `price.proto` uses.
fn parse_proto(source: &str) -> Contract {
    let mut contract = Contract {
        package: String::new(),
        service: String::new(),
        messages: Vec::new(),
        rpcs: Vec::new(),
    };
    let mut current: Option<Message> = None;

    for raw in source.lines() {
        let line = raw.split("//").next().unwrap().trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("package ") {
            contract.package = rest.trim_end_matches(';').trim().to_string();
        } else if let Some(rest) = line.strip_prefix("service ") {
            contract.service = rest.trim_end_matches('{').trim().to_string();
        } else if let Some(rest) = line.strip_prefix("message ") {
            current = Some(Message {
                name: rest.trim_end_matches('{').trim().to_string(),
                fields: Vec::new(),
            });
        } else if let Some(rest) = line.strip_prefix("rpc ") {
            let name = rest.split('(').next().unwrap().trim().to_string();
            let returns = rest.split("returns").nth(1).expect("rpc without returns");
            contract.rpcs.push(Rpc {
                name,
                server_streaming: returns.contains("stream "),
            });
        } else if line == "}" {
            if let Some(message) = current.take() {
                contract.messages.push(message);
            }
        } else if let Some(message) = current.as_mut() {
            let (decl, tag) = line.trim_end_matches(';').split_once('=').unwrap();
            let words: Vec<&str> = decl.split_whitespace().collect();
            let (repeated, words) = match words.as_slice() {
                ["repeated", rest @ ..] => (true, rest.to_vec()),
                rest => (false, rest.to_vec()),
            };
            let [scalar, name] = words.as_slice() else {
                panic!("unsupported field declaration: {line}");
            };
            message.fields.push(Field {
                name: (*name).to_string(),
                scalar: (*scalar).to_string(),
                repeated,
                tag: tag.trim().parse().unwrap(),
            });
        }
    }
    contract
}

/// Generated source with doc comments dropped and indentation removed.
fn normalised_generated() -> String {
    read("src/infrastructure/grpc/proto/price.v1.rs")
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("///"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn contract() -> Contract {
    parse_proto(&read("proto/price/v1/price.proto"))
}

#[test]
fn test_every_message_field_matches_its_tag_and_type() {
    let contract = contract();
    let generated = normalised_generated();
    assert!(!contract.messages.is_empty());

    for message in &contract.messages {
        let header = format!("pub struct {} {{", message.name);
        let start = generated
            .find(&header)
            .unwrap_or_else(|| panic!("no struct generated for message {}", message.name));
        let body = &generated[start + header.len()..];
        let body = &body[..body.find("\n}").expect("unterminated struct")];

        for field in &message.fields {
            let attr = if field.repeated {
                format!("{}, repeated, tag = \"{}\"", field.scalar, field.tag)
            } else {
                format!("{}, tag = \"{}\"", field.scalar, field.tag)
            };
            let expected = format!("#[prost({attr})]\npub {}:", field.name);
            assert!(
                body.contains(&expected),
                "{}.{} is out of date, expected:\n{expected}",
                message.name,
                field.name
            );
        }
        assert_eq!(
            body.matches("#[prost(").count(),
            message.fields.len(),
            "{} has fields that are not in the proto",
            message.name
        );
    }
}

#[test]
fn test_no_extra_messages_are_generated() {
    let contract = contract();
    let generated = normalised_generated();
    assert_eq!(
        generated.matches("::prost::Message)]").count(),
        contract.messages.len()
    );
}

#[test]
fn test_every_rpc_is_routed() {
    let contract = contract();
    let generated = normalised_generated();
    assert!(!contract.rpcs.is_empty());

    let service = format!("{}.{}", contract.package, contract.service);
    assert!(generated.contains(&format!("pub const SERVICE_NAME: &str = \"{service}\";")));

    for rpc in &contract.rpcs {
        let path = format!("\"/{service}/{}\"", rpc.name);
        assert_eq!(
            generated.matches(&path).count(),
            2,
            "{path} must appear once in the client and once in the server"
        );
        if rpc.server_streaming {
            assert!(generated.contains("server_streaming("));
        }
    }
}
