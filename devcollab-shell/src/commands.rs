//! Console command grammar.

use devcollab_sync::{EntityKind, NetworkCandidate};

pub const HELP: &str = "\
msg <text>                 queue a chat message
edit <kind> <text>         queue a project/document edit
flush [kind]               flush pending writes (all kinds by default)
cancel                     cancel in-flight flushes
pending                    list pending writes
dead                       list dead-lettered writes
retry <id> | discard <id>  resolve a dead-lettered write
online | offline           switch connectivity
call <peer>                start a call
candidate <peer> <ip> <port>
hangup [peer]              leave the call, or drop one peer
status                     show call and queue state
quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Enqueue(EntityKind, String),
    Flush(Option<EntityKind>),
    Cancel,
    Pending,
    Dead,
    Retry(u64),
    Discard(u64),
    Online(bool),
    Call(String),
    Candidate(String, NetworkCandidate),
    Hangup(Option<String>),
    Status,
    Help,
    Quit,
}

/// Parse one input line. Blank lines parse to `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match verb {
        "msg" => Command::Enqueue(EntityKind::Message, required(rest, "msg <text>")?.to_string()),
        "edit" => {
            let (kind, text) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: edit <kind> <text>")?;
            let kind: EntityKind = kind.parse()?;
            Command::Enqueue(kind, text.trim().to_string())
        }
        "flush" if rest.is_empty() => Command::Flush(None),
        "flush" => Command::Flush(Some(rest.parse()?)),
        "cancel" => Command::Cancel,
        "pending" => Command::Pending,
        "dead" => Command::Dead,
        "retry" => Command::Retry(parse_id(rest)?),
        "discard" => Command::Discard(parse_id(rest)?),
        "online" => Command::Online(true),
        "offline" => Command::Online(false),
        "call" => Command::Call(required(rest, "call <peer>")?.to_string()),
        "candidate" => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let [peer, address, port] = parts[..] else {
                return Err("usage: candidate <peer> <ip> <port>".into());
            };
            let port: u16 = port.parse().map_err(|_| format!("bad port: {port}"))?;
            Command::Candidate(peer.to_string(), NetworkCandidate::new(address, port, 1))
        }
        "hangup" if rest.is_empty() => Command::Hangup(None),
        "hangup" => Command::Hangup(Some(rest.to_string())),
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command: {other} (try `help`)")),
    };
    Ok(Some(command))
}

fn required<'a>(rest: &'a str, usage: &str) -> Result<&'a str, String> {
    if rest.is_empty() {
        Err(format!("usage: {usage}"))
    } else {
        Ok(rest)
    }
}

fn parse_id(rest: &str) -> Result<u64, String> {
    rest.parse().map_err(|_| format!("bad write id: {rest:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_queue_commands() {
        assert_eq!(
            parse("msg hello there").unwrap(),
            Some(Command::Enqueue(EntityKind::Message, "hello there".into()))
        );
        assert_eq!(
            parse("edit doc intro paragraph").unwrap(),
            Some(Command::Enqueue(EntityKind::DocumentEdit, "intro paragraph".into()))
        );
        assert_eq!(
            parse("flush project").unwrap(),
            Some(Command::Flush(Some(EntityKind::ProjectEdit)))
        );
        assert_eq!(parse("flush").unwrap(), Some(Command::Flush(None)));
        assert_eq!(parse("retry 12").unwrap(), Some(Command::Retry(12)));
    }

    #[test]
    fn test_parse_call_commands() {
        assert_eq!(parse("call bob").unwrap(), Some(Command::Call("bob".into())));
        assert_eq!(parse("hangup").unwrap(), Some(Command::Hangup(None)));
        assert_eq!(
            parse("hangup bob").unwrap(),
            Some(Command::Hangup(Some("bob".into())))
        );
        assert_eq!(
            parse("candidate bob 10.0.0.7 5004").unwrap(),
            Some(Command::Candidate(
                "bob".into(),
                NetworkCandidate::new("10.0.0.7", 5004, 1)
            ))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("   ").unwrap(), None);
        assert!(parse("msg").is_err());
        assert!(parse("edit spreadsheet x").is_err());
        assert!(parse("retry abc").is_err());
        assert!(parse("candidate bob 10.0.0.7").is_err());
        assert!(parse("dance").is_err());
    }
}
