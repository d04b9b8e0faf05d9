//! Replaying recorded probe and GC events against a shadow heap.
//!
//! A trace is plain text, one event per line:
//!
//! ```text
//! alloc    <addr> <size> [type=<name>] [array]
//! local    <addr> <size> <frame> <index> [param]
//! static   <addr> <size> <id>
//! delegate <delegate-addr> <function-id> <closure-addr>
//! write    <addr> <size> concrete|symbolic
//! read     <addr> <size>
//! resolve  <addr>
//! move     <old> <new> <len>
//! survive  <start> <len>
//! sweep
//! flush
//! retire   <addr>
//! ```
//!
//! `#` starts a comment. Numbers are decimal or `0x` hex.

use std::io::Write;

use crate::{
    error::ShadowError,
    interval::Address,
    object::{LocalObject, ObjectLocation},
    protocol::MemoryUpdate,
    shadow::{ShadowHeap, parse_number},
    storage::ObjectId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Alloc {
        address: Address,
        size: usize,
        type_name: Vec<u8>,
        is_array: bool,
    },
    Local {
        address: Address,
        size: usize,
        frame: u8,
        index: u8,
        parameter: bool,
    },
    Static {
        address: Address,
        size: usize,
        id: i16,
    },
    Delegate {
        delegate: Address,
        function_id: i32,
        closure: Address,
    },
    Write {
        address: Address,
        size: usize,
        concrete: bool,
    },
    Read {
        address: Address,
        size: usize,
    },
    Resolve {
        address: Address,
    },
    Move {
        old: Address,
        new: Address,
        length: usize,
    },
    Survive {
        start: Address,
        length: usize,
    },
    Sweep,
    Flush,
    Retire {
        address: Address,
    },
}

struct Tokens<'a> {
    line: usize,
    parts: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn error(&self, message: impl Into<String>) -> ShadowError {
        ShadowError::Trace {
            line: self.line,
            message: message.into(),
        }
    }

    fn number<T: TryFrom<u64>>(&mut self, what: &str) -> Result<T, ShadowError> {
        let token = self
            .parts
            .next()
            .ok_or_else(|| self.error(format!("missing {}", what)))?;
        parse_number(token)
            .and_then(|value| T::try_from(value).ok())
            .ok_or_else(|| self.error(format!("bad {} {:?}", what, token)))
    }

    fn signed(&mut self, what: &str) -> Result<i64, ShadowError> {
        let token = self
            .parts
            .next()
            .ok_or_else(|| self.error(format!("missing {}", what)))?;
        let value = match token.strip_prefix('-') {
            Some(rest) => parse_number(rest).and_then(|v| i64::try_from(v).ok()).map(|v| -v),
            None => parse_number(token).and_then(|v| i64::try_from(v).ok()),
        };
        value.ok_or_else(|| self.error(format!("bad {} {:?}", what, token)))
    }

    fn rest(&mut self) -> Vec<&'a str> {
        self.parts.by_ref().collect()
    }

    fn finish(&mut self) -> Result<(), ShadowError> {
        match self.parts.next() {
            Some(extra) => Err(self.error(format!("unexpected {:?}", extra))),
            None => Ok(()),
        }
    }
}

/// `Ok(None)` for blank and comment lines.
pub fn parse_line(text: &str, line: usize) -> Result<Option<Event>, ShadowError> {
    let text = text.split('#').next().unwrap_or_default();
    let mut parts = text.split_whitespace();
    let Some(keyword) = parts.next() else {
        return Ok(None);
    };
    let mut tokens = Tokens { line, parts };
    let event = match keyword {
        "alloc" => {
            let address = tokens.number("address")?;
            let size = tokens.number("size")?;
            let mut type_name = Vec::new();
            let mut is_array = false;
            for flag in tokens.rest() {
                match flag {
                    "array" => is_array = true,
                    _ => match flag.strip_prefix("type=") {
                        Some(name) => type_name = name.as_bytes().to_vec(),
                        None => return Err(tokens.error(format!("unknown flag {:?}", flag))),
                    },
                }
            }
            Event::Alloc {
                address,
                size,
                type_name,
                is_array,
            }
        }
        "local" => {
            let address = tokens.number("address")?;
            let size = tokens.number("size")?;
            let frame = tokens.number("frame")?;
            let index = tokens.number("index")?;
            let parameter = match tokens.rest().as_slice() {
                [] => false,
                ["param"] => true,
                other => return Err(tokens.error(format!("unexpected {:?}", other))),
            };
            Event::Local {
                address,
                size,
                frame,
                index,
                parameter,
            }
        }
        "static" => {
            let address = tokens.number("address")?;
            let size = tokens.number("size")?;
            let id = tokens.signed("static id")?;
            let id = i16::try_from(id).map_err(|_| tokens.error("static id out of range"))?;
            Event::Static { address, size, id }
        }
        "delegate" => {
            let delegate = tokens.number("delegate address")?;
            let function_id = tokens.signed("function id")?;
            let function_id =
                i32::try_from(function_id).map_err(|_| tokens.error("function id out of range"))?;
            let closure = tokens.number("closure address")?;
            Event::Delegate {
                delegate,
                function_id,
                closure,
            }
        }
        "write" => {
            let address = tokens.number("address")?;
            let size = tokens.number("size")?;
            let concrete = match tokens.parts.next() {
                Some("concrete") => true,
                Some("symbolic") => false,
                other => {
                    return Err(tokens.error(format!(
                        "expected concrete or symbolic, got {:?}",
                        other
                    )));
                }
            };
            Event::Write {
                address,
                size,
                concrete,
            }
        }
        "read" => Event::Read {
            address: tokens.number("address")?,
            size: tokens.number("size")?,
        },
        "resolve" => Event::Resolve {
            address: tokens.number("address")?,
        },
        "move" => Event::Move {
            old: tokens.number("old address")?,
            new: tokens.number("new address")?,
            length: tokens.number("length")?,
        },
        "survive" => Event::Survive {
            start: tokens.number("start")?,
            length: tokens.number("length")?,
        },
        "sweep" => Event::Sweep,
        "flush" => Event::Flush,
        "retire" => Event::Retire {
            address: tokens.number("address")?,
        },
        other => return Err(tokens.error(format!("unknown event {:?}", other))),
    };
    tokens.finish()?;
    Ok(Some(event))
}

pub fn parse(text: &str) -> Result<Vec<(usize, Event)>, ShadowError> {
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if let Some(event) = parse_line(line, index + 1)? {
            events.push((index + 1, event));
        }
    }
    Ok(events)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub events: usize,
    pub swept: usize,
    pub live: usize,
}

/// Applies events in order, writing one line of output per query.
pub struct Replayer<'a, W: Write> {
    heap: &'a ShadowHeap,
    out: W,
    stats: ReplayStats,
}

impl<'a, W: Write> Replayer<'a, W> {
    pub fn new(heap: &'a ShadowHeap, out: W) -> Self {
        Replayer {
            heap,
            out,
            stats: ReplayStats::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn run(&mut self, events: &[(usize, Event)]) -> Result<ReplayStats, ShadowError> {
        for (line, event) in events {
            log::trace!("line {}: {:?}", line, event);
            self.apply(event).map_err(|err| {
                log::error!("Replay stopped at line {}", line);
                err
            })?;
            self.stats.events += 1;
        }
        self.stats.live = self.heap.lock().len();
        Ok(self.stats)
    }

    fn reference(&self, address: Address) -> ObjectId {
        match self.heap.lock().resolve(address) {
            Some(resolved) => resolved.obj,
            None => {
                log::warn!("Delegate refers to untracked {:#x}", address);
                ObjectId::NULL
            }
        }
    }

    pub fn apply(&mut self, event: &Event) -> Result<(), ShadowError> {
        match event {
            Event::Alloc {
                address,
                size,
                type_name,
                is_array,
            } => {
                let id =
                    self.heap
                        .lock()
                        .allocate_object(*address, *size, type_name.clone(), *is_array)?;
                writeln!(self.out, "alloc {:#x} -> {}", address, id)?;
            }
            Event::Local {
                address,
                size,
                frame,
                index,
                parameter,
            } => {
                if *size == 0 {
                    return Err(ShadowError::EmptyRegion { address: *address });
                }
                let location = if *parameter {
                    ObjectLocation::parameter(*frame, *index)
                } else {
                    ObjectLocation::local(*frame, *index)
                };
                let mut local = LocalObject::addressed(*address, *size, location);
                let id = self.heap.lock().allocate_local(&mut local)?;
                writeln!(self.out, "local {:#x} -> {}", address, id)?;
            }
            Event::Static { address, size, id } => {
                let obj = self.heap.lock().allocate_static_field(*address, *size, *id)?;
                writeln!(self.out, "static {:#x} -> {}", address, obj)?;
            }
            Event::Delegate {
                delegate,
                function_id,
                closure,
            } => {
                let delegate = self.heap.lock().phys_to_virt(*delegate)?.obj;
                let closure = self.reference(*closure);
                self.heap
                    .lock()
                    .allocate_delegate(delegate, *function_id, closure);
            }
            Event::Write {
                address,
                size,
                concrete,
            } => {
                self.heap
                    .lock()
                    .write_concreteness(*address, *size, *concrete)?;
            }
            Event::Read { address, size } => {
                let concrete = self.heap.lock().read_concreteness(*address, *size)?;
                let state = if concrete { "concrete" } else { "symbolic" };
                writeln!(self.out, "read {:#x} {} {}", address, size, state)?;
            }
            Event::Resolve { address } => match self.heap.lock().resolve(*address) {
                Some(resolved) => writeln!(
                    self.out,
                    "resolve {:#x} -> {}+{} {}",
                    address,
                    resolved.obj,
                    resolved.offset,
                    resolved.location.kind.name()
                )?,
                None => writeln!(self.out, "resolve {:#x} unresolved", address)?,
            },
            Event::Move { old, new, length } => {
                let mut guard = self.heap.lock();
                guard.move_and_mark(*old, *new, *length)?;
                self.validate(&guard)?;
            }
            Event::Survive { start, length } => {
                let mut guard = self.heap.lock();
                guard.mark_survived_objects(*start, *length)?;
                self.validate(&guard)?;
            }
            Event::Sweep => {
                let mut guard = self.heap.lock();
                let swept = guard.clear_after_gc();
                self.validate(&guard)?;
                drop(guard);
                self.stats.swept += swept;
                writeln!(self.out, "sweep {}", swept)?;
            }
            Event::Flush => self.flush()?,
            Event::Retire { address } => {
                let mut guard = self.heap.lock();
                let id = guard.phys_to_virt(*address)?.obj;
                let retired = guard.delete_objects(&[id]);
                drop(guard);
                if retired == 0 {
                    log::warn!("Nothing retired at {:#x}: region is collector-owned", address);
                }
                writeln!(self.out, "retire {:#x} {}", address, retired)?;
            }
        }
        Ok(())
    }

    fn validate(&self, guard: &crate::shadow::CommandGuard<'_>) -> Result<(), ShadowError> {
        if self.heap.options().validate {
            guard.try_validate()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ShadowError> {
        let (update, regions) = {
            let mut guard = self.heap.lock();
            let update = guard.drain_update();
            (update, guard.flush_regions())
        };
        let encoded = update.encode()?;
        writeln!(
            self.out,
            "flush new={} deleted={} delegates={} regions={} bytes={}",
            update.new_objects.len(),
            update.deleted.len(),
            update.delegates.len(),
            regions.len(),
            encoded.len()
        )?;
        let MemoryUpdate {
            new_objects,
            deleted,
            delegates,
        } = update;
        for object in new_objects {
            writeln!(
                self.out,
                "  new {} {}",
                object.id,
                String::from_utf8_lossy(&object.type_name)
            )?;
        }
        for id in deleted {
            writeln!(self.out, "  deleted {}", id)?;
        }
        for record in delegates {
            writeln!(
                self.out,
                "  delegate {} {} {}",
                record.delegate, record.function_id, record.closure
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::ShadowOptions;

    fn replay(text: &str) -> Result<(String, ReplayStats), ShadowError> {
        let heap = ShadowHeap::new(ShadowOptions {
            seed: Some(5),
            validate: true,
        });
        let events = parse(text)?;
        let mut replayer = Replayer::new(&heap, Vec::new());
        let stats = replayer.run(&events)?;
        Ok((String::from_utf8(replayer.into_inner()).unwrap(), stats))
    }

    #[test]
    fn test_parse_events() {
        assert_eq!(parse_line("  # only a comment", 1).unwrap(), None);
        assert_eq!(
            parse_line("alloc 0x10 16 type=Foo array # trailing", 2).unwrap(),
            Some(Event::Alloc {
                address: 0x10,
                size: 16,
                type_name: b"Foo".to_vec(),
                is_array: true
            })
        );
        assert_eq!(
            parse_line("static 0x20 8 -3", 3).unwrap(),
            Some(Event::Static {
                address: 0x20,
                size: 8,
                id: -3
            })
        );
        assert_eq!(
            parse_line("local 0x30 4 1 2 param", 4).unwrap(),
            Some(Event::Local {
                address: 0x30,
                size: 4,
                frame: 1,
                index: 2,
                parameter: true
            })
        );
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let err = parse("sweep\nwrite 0x10 4 maybe\n").unwrap_err();
        assert!(matches!(err, ShadowError::Trace { line: 2, .. }));
        assert!(parse_line("local 0x30 4 300 2", 1).is_err());
        assert!(parse_line("sweep now", 1).is_err());
        assert!(parse_line("teleport 0x10", 1).is_err());
    }

    #[test]
    fn test_replay_move_keeps_identity() {
        let (out, stats) = replay(
            "alloc 0x1000 16 type=Box\n\
             write 0x1004 4 symbolic\n\
             read 0x1004 4\n\
             read 0x1000 4\n\
             move 0x1000 0x2000 16\n\
             sweep\n\
             resolve 0x2004\n\
             read 0x2004 4\n\
             resolve 0x1004\n",
        )
        .unwrap();
        let lines: Vec<&str> = out.lines().collect();
        let id = lines[0].rsplit(' ').next().unwrap();
        assert_eq!(lines[1], "read 0x1004 4 symbolic");
        assert_eq!(lines[2], "read 0x1000 4 concrete");
        assert_eq!(lines[3], "sweep 0");
        assert_eq!(lines[4], format!("resolve 0x2004 -> {}+4 heap", id));
        assert_eq!(lines[5], "read 0x2004 4 symbolic");
        assert_eq!(lines[6], "resolve 0x1004 unresolved");
        assert_eq!(stats.events, 9);
        assert_eq!(stats.live, 1);
    }

    #[test]
    fn test_replay_flush_and_retire() {
        let (out, stats) = replay(
            "alloc 0x1000 8 type=A\n\
             alloc 0x2000 8 type=B\n\
             local 0x7000 8 0 1\n\
             delegate 0x1000 7 0x2000\n\
             flush\n\
             flush\n\
             survive 0x2000 8\n\
             sweep\n\
             retire 0x7000\n\
             flush\n",
        )
        .unwrap();
        let flushes: Vec<&str> = out.lines().filter(|l| l.starts_with("flush")).collect();
        assert!(flushes[0].starts_with("flush new=2 deleted=0 delegates=1 regions=3"));
        assert!(flushes[1].starts_with("flush new=0 deleted=0 delegates=0 regions=0"));
        assert!(flushes[2].starts_with("flush new=0 deleted=1 delegates=0 regions=0"));
        assert!(out.contains("  new "));
        assert!(out.contains("retire 0x7000 1"));
        assert_eq!(stats.swept, 1);
        assert_eq!(stats.live, 1);
    }

    #[test]
    fn test_replay_rejects_moving_stack_memory() {
        let err = replay("local 0x7000 8 0 1\nmove 0x7000 0x9000 8\n").unwrap_err();
        assert!(matches!(err, ShadowError::UnhandledByGcMoved { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_replay_rejects_overlapping_alloc() {
        let err = replay("alloc 0x1000 16
alloc 0x1008 16
").unwrap_err();
        assert!(matches!(err, ShadowError::AllocationOverlap { .. }));
        assert!(err.is_fatal());
    }
}
