//! The permission exchange document depots trade during peer registration.
//!
//! ```xml
//! <permissions>
//!   <permission><action>ping</action><dns><dn>CN=a</dn><dn>CN=b</dn></dns></permission>
//!   <permission><action>PEER</action><dns><dn>CN=depot2</dn></dns></permission>
//! </permissions>
//! ```
//!
//! The document shape is fixed, so rather than a general XML parser this module carries a small
//! tokenizer that understands elements, text, entities, CDATA sections, comments and the XML
//! declaration, which is everything a peer ever sends.

use std::collections::BTreeMap;

use crate::error::{DepotError, Result};

/// Renders `perms` (action → names) as an exchange document.
pub(crate) fn to_xml(perms: &BTreeMap<String, Vec<String>>) -> String {
    let mut xml = String::from("<permissions>");
    for (action, names) in perms {
        xml.push_str("<permission><action>");
        xml.push_str(&escape(action));
        xml.push_str("</action><dns>");
        for name in names {
            xml.push_str("<dn>");
            xml.push_str(&escape(name));
            xml.push_str("</dn>");
        }
        xml.push_str("</dns></permission>");
    }
    xml.push_str("</permissions>");
    xml
}

/// Parses an exchange document into `(action, names)` pairs, in document order.
pub(crate) fn from_xml(xml: &str) -> Result<Vec<(String, Vec<String>)>> {
    let tokens = tokenize(xml)?;
    let mut tokens = tokens.into_iter().filter(|t| !t.is_blank()).peekable();
    let mut perms = Vec::new();

    expect_start(&mut tokens, "permissions")?;
    loop {
        match tokens.next() {
            Some(Token::End(name)) if name == "permissions" => break,
            Some(Token::Start(name)) if name == "permission" => {
                let mut action = None;
                let mut names = Vec::new();
                loop {
                    match tokens.next() {
                        Some(Token::End(name)) if name == "permission" => break,
                        Some(Token::Start(name)) if name == "action" => {
                            action = Some(text_until(&mut tokens, "action")?);
                        }
                        Some(Token::Start(name)) if name == "dns" => loop {
                            match tokens.next() {
                                Some(Token::End(name)) if name == "dns" => break,
                                Some(Token::Start(name)) if name == "dn" => {
                                    names.push(text_until(&mut tokens, "dn")?)
                                }
                                Some(Token::Empty(name)) if name == "dn" => names.push(String::new()),
                                other => return Err(unexpected(other, "<dn>")),
                            }
                        },
                        Some(Token::Empty(name)) if name == "dns" => {}
                        other => return Err(unexpected(other, "<action> or <dns>")),
                    }
                }
                let action = action.ok_or_else(|| DepotError::Exchange("permission without an action".into()))?;
                perms.push((action, names));
            }
            other => return Err(unexpected(other, "<permission>")),
        }
    }
    Ok(perms)
}

#[derive(Debug, PartialEq)]
enum Token {
    Start(String),
    End(String),
    Empty(String),
    Text(String),
}

impl Token {
    fn is_blank(&self) -> bool {
        matches!(self, Token::Text(t) if t.trim().is_empty())
    }
}

fn expect_start<I: Iterator<Item = Token>>(tokens: &mut I, element: &str) -> Result<()> {
    match tokens.next() {
        Some(Token::Start(name)) if name == element => Ok(()),
        other => Err(unexpected(other, &format!("<{}>", element))),
    }
}

// collects text up to the closing tag of `element`
fn text_until<I: Iterator<Item = Token>>(tokens: &mut I, element: &str) -> Result<String> {
    let mut text = String::new();
    loop {
        match tokens.next() {
            Some(Token::Text(t)) => text.push_str(&t),
            Some(Token::End(name)) if name == element => return Ok(text),
            other => return Err(unexpected(other, &format!("</{}>", element))),
        }
    }
}

fn unexpected(found: Option<Token>, wanted: &str) -> DepotError {
    match found {
        Some(token) => DepotError::Exchange(format!("expected {}, found {:?}", wanted, token)),
        None => DepotError::Exchange(format!("expected {}, found end of document", wanted)),
    }
}

fn tokenize(xml: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = xml;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("<![CDATA[") {
            let end = after
                .find("]]>")
                .ok_or_else(|| DepotError::Exchange("unterminated CDATA section".into()))?;
            push_text(&mut tokens, after[..end].to_string());
            rest = &after[end + 3..];
        } else if let Some(after) = rest.strip_prefix("<!--") {
            let end = after
                .find("-->")
                .ok_or_else(|| DepotError::Exchange("unterminated comment".into()))?;
            rest = &after[end + 3..];
        } else if let Some(after) = rest.strip_prefix("<?") {
            let end = after
                .find("?>")
                .ok_or_else(|| DepotError::Exchange("unterminated declaration".into()))?;
            rest = &after[end + 2..];
        } else if let Some(after) = rest.strip_prefix('<') {
            let end = after
                .find('>')
                .ok_or_else(|| DepotError::Exchange("unterminated tag".into()))?;
            let tag = after[..end].trim();
            tokens.push(if let Some(name) = tag.strip_prefix('/') {
                Token::End(name.trim().to_string())
            } else if let Some(tag) = tag.strip_suffix('/') {
                Token::Empty(element_name(tag))
            } else {
                Token::Start(element_name(tag))
            });
            rest = &after[end + 1..];
        } else {
            let end = rest.find('<').unwrap_or(rest.len());
            push_text(&mut tokens, unescape(&rest[..end])?);
            rest = &rest[end..];
        }
    }
    Ok(tokens)
}

// adjacent text and CDATA runs form one text token
fn push_text(tokens: &mut Vec<Token>, text: String) {
    if let Some(Token::Text(prev)) = tokens.last_mut() {
        prev.push_str(&text);
    } else {
        tokens.push(Token::Text(text));
    }
}

// attributes are not part of the document, only the element name matters
fn element_name(tag: &str) -> String {
    tag.split_whitespace().next().unwrap_or("").to_string()
}

// CR is encoded too, so a document never holds the CRLF that ends a statement
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\r' => out.push_str("&#13;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| DepotError::Exchange(format!("unterminated entity in '{}'", s)))?;
        let entity = &after[..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
            }
        };
        match decoded {
            Some(c) => out.push(c),
            None => return Err(DepotError::Exchange(format!("unknown entity '&{};'", entity))),
        }
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_and_reads_back() {
        let mut perms = BTreeMap::new();
        perms.insert("ping".to_string(), vec!["CN=a & <b>".to_string(), "CN=c".to_string()]);
        perms.insert("PEER".to_string(), vec!["CN=depot".to_string()]);
        let xml = to_xml(&perms);
        assert!(xml.starts_with("<permissions><permission><action>PEER</action>"));

        let parsed: BTreeMap<_, _> = from_xml(&xml).unwrap().into_iter().collect();
        assert_eq!(parsed, perms);
    }

    #[test]
    fn carriage_returns_never_reach_the_wire() {
        let mut perms = BTreeMap::new();
        perms.insert("ping".to_string(), vec!["CN=a\r\nO=b".to_string()]);
        let xml = to_xml(&perms);
        assert!(!xml.contains('\r'));
        assert!(xml.contains("CN=a&#13;\nO=b"));

        let parsed: BTreeMap<_, _> = from_xml(&xml).unwrap().into_iter().collect();
        assert_eq!(parsed, perms);
    }

    #[test]
    fn tolerates_whitespace_declaration_and_cdata() {
        let xml = r#"<?xml version="1.0"?>
            <!-- exported -->
            <permissions>
              <permission>
                <action>insert</action>
                <dns><dn><![CDATA[CN=x<y]]></dn><dn>CN=&#65;</dn></dns>
              </permission>
              <permission><action>suite</action><dns/></permission>
            </permissions>"#;
        let perms = from_xml(xml).unwrap();
        assert_eq!(
            perms,
            vec![
                ("insert".to_string(), vec!["CN=x<y".to_string(), "CN=A".to_string()]),
                ("suite".to_string(), vec![]),
            ]
        );
    }

    #[test]
    fn rejects_other_documents() {
        assert!(from_xml("<report><body/></report>").is_err());
        assert!(from_xml("<permissions><permission>").is_err());
        assert!(from_xml("").is_err());
    }
}
