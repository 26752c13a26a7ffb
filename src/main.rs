use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use log::{error, info};
use solcon_monitor::{FieldDef, FieldDefs, FieldId, LockId, Monitor, MonitorConfig, MonitorError, ObjectId, ThreadId, ThreadInfo};
use thiserror::Error;

const USAGE: &str = "usage: solcon-monitor [--fields <fields-file>] <trace-file>";

#[derive(Error, Debug)]
enum TraceError {
    #[error("{path}:{line}: {detail}")]
    Malformed { path: PathBuf, line: usize, detail: String },
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
enum Event {
    Field { field: FieldId, thread: ThreadId, receiver: Option<ObjectId>, under_construction: bool },
    Lock { thread: ThreadId, lock: LockId },
    Unlock { thread: ThreadId, lock: LockId },
    Gc { object: ObjectId },
    Ui { thread: ThreadId },
    Name { lock: LockId, name: String },
    RwLock { lock: LockId, read: LockId, write: LockId },
    Thread { thread: ThreadId, name: String },
    Tick,
}

fn parse_line(text: &str) -> Result<Option<Event>, String> {
    // a comment starts at a word beginning with `#`
    let mut words = text.split_whitespace().take_while(|w| !w.starts_with('#'));
    let Some(kind) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let num = |i: usize| -> Result<u64, String> {
        let word = rest.get(i).ok_or_else(|| format!("`{kind}` expects more arguments"))?;
        word.parse::<u64>().map_err(|e| format!("bad number {word:?}: {e}"))
    };
    let event = match kind {
        "field" => {
            let receiver = match rest.get(2) {
                None | Some(&"-") => None,
                Some(_) => Some(num(2)?),
            };
            let under_construction = match rest.get(3) {
                None => false,
                Some(&"ctor") => true,
                Some(other) => return Err(format!("unexpected {other:?}, expected `ctor`")),
            };
            Event::Field { field: num(0)?, thread: num(1)?, receiver, under_construction }
        }
        "lock" => Event::Lock { thread: num(0)?, lock: num(1)? },
        "unlock" => Event::Unlock { thread: num(0)?, lock: num(1)? },
        "gc" => Event::Gc { object: num(0)? },
        "ui" => Event::Ui { thread: num(0)? },
        "name" => Event::Name { lock: num(0)?, name: rest[1..].join(" ") },
        "rwlock" => Event::RwLock { lock: num(0)?, read: num(1)?, write: num(2)? },
        "thread" => Event::Thread { thread: num(0)?, name: rest[1..].join(" ") },
        "tick" => Event::Tick,
        other => return Err(format!("unknown event {other:?}")),
    };
    if matches!(event, Event::Name { .. } | Event::Thread { .. }) && rest.len() < 2 {
        return Err(format!("`{kind}` expects a name"));
    }
    Ok(Some(event))
}

fn read_trace(path: &Path) -> Result<Vec<Event>, TraceError> {
    let io_err = |source| TraceError::Io { path: path.to_path_buf(), source };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        match parse_line(&line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(detail) => {
                return Err(TraceError::Malformed { path: path.to_path_buf(), line: idx + 1, detail });
            }
        }
    }
    Ok(events)
}

/// Without a fields file every field in the trace gets a placeholder name.
fn placeholder_fields(events: &[Event]) -> FieldDefs {
    let mut statics: BTreeMap<FieldId, bool> = BTreeMap::new();
    for event in events {
        if let Event::Field { field, receiver, .. } = event {
            statics.entry(*field).or_insert(receiver.is_none());
        }
    }
    statics
        .into_iter()
        .map(|(id, is_static)| FieldDef::new(id, "trace", format!("f{id}"), is_static))
        .collect()
}

fn replay(monitor: &Monitor, events: Vec<Event>) -> Result<(), TraceError> {
    for event in events {
        match event {
            Event::Field { field, thread, receiver, under_construction } => {
                monitor.on_field_access(thread, field, receiver, under_construction)
            }
            Event::Lock { thread, lock } => monitor.on_lock_acquired(thread, lock),
            Event::Unlock { thread, lock } => monitor.on_lock_released(thread, lock),
            Event::Gc { object } => monitor.on_object_collected(object),
            Event::Ui { thread } => monitor.mark_ui_thread(thread, true),
            Event::Name { lock, name } => monitor.name_lock(lock, name),
            Event::RwLock { lock, read, write } => monitor.define_rw_lock(lock, read, write),
            Event::Thread { thread, name } => monitor.register_thread(ThreadInfo::new(thread, Some(name))),
            Event::Tick => {
                let snap = monitor.tick_now()?;
                info!("tick {}: {} alerts", snap.tick, snap.alerts.len());
            }
        }
    }
    Ok(())
}

fn run(args: Vec<String>) -> Result<(), TraceError> {
    let mut config = MonitorConfig::from_env()?;
    let mut trace = None;
    let mut iter = args.into_iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--fields" => match iter.next() {
                Some(path) => config = config.with_fields_file(path),
                None => {
                    return Err(TraceError::Malformed { path: PathBuf::new(), line: 0, detail: USAGE.to_owned() });
                }
            },
            _ => trace = Some(PathBuf::from(arg)),
        }
    }
    let Some(trace) = trace else {
        return Err(TraceError::Malformed { path: PathBuf::new(), line: 0, detail: USAGE.to_owned() });
    };

    let events = read_trace(&trace)?;
    let fields = match &config.fields_file {
        Some(path) => FieldDefs::load(path)?,
        None => placeholder_fields(&events),
    };
    if config.tracked_fields.is_empty() {
        info!("no tracked field pattern given, tracking every field");
        config = config.with_tracked_fields(".*");
    }
    info!("replaying {} events from {}", events.len(), trace.display());

    let monitor = Monitor::new(config, fields)?;
    replay(&monitor, events)?;
    monitor.wrap_up();
    print!("{}", monitor.summary());
    Ok(())
}

fn main() -> ExitCode {
    let e = env_logger::Env::new().filter("SOLCON_LOG").write_style("SOLCON_LOG_STYLE");
    env_logger::init_from_env(e);

    match run(std::env::args().collect()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_events() {
        let Some(Event::Field { field, thread, receiver, under_construction }) = parse_line("field 3 1 7 ctor").unwrap()
        else {
            panic!("not a field event");
        };
        assert_eq!((field, thread, receiver, under_construction), (3, 1, Some(7), true));
        assert!(matches!(
            parse_line("field 3 1 -").unwrap(),
            Some(Event::Field { receiver: None, under_construction: false, .. })
        ));
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   # nothing here").unwrap().is_none());
        assert!(matches!(parse_line("tick # end of phase").unwrap(), Some(Event::Tick)));
        assert!(matches!(parse_line("tick #end").unwrap(), Some(Event::Tick)));
    }

    #[test]
    fn hash_inside_a_word_is_kept() {
        let Some(Event::Name { lock, name }) = parse_line("name 5 lock#5 # main table").unwrap() else {
            panic!("not a name event");
        };
        assert_eq!((lock, name.as_str()), (5, "lock#5"));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("lock 1").is_err());
        assert!(parse_line("lock one 2").is_err());
        assert!(parse_line("jump 1").is_err());
        assert!(parse_line("field 1 2 3 later").is_err());
        assert!(parse_line("name 4").is_err());
    }

    #[test]
    fn placeholder_names() {
        let events = vec![
            Event::Field { field: 2, thread: 1, receiver: None, under_construction: false },
            Event::Field { field: 5, thread: 1, receiver: Some(9), under_construction: false },
        ];
        let defs = placeholder_fields(&events);
        assert_eq!(defs.len(), 2);
        assert!(defs.get(2).unwrap().is_static);
        assert_eq!(defs.get(5).unwrap().qualified_name(), "trace.f5");
    }
}
