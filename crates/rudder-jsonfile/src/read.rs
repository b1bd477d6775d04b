//! Read sessions: tail, time window and follow over all generations.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rudder_filewatch::{FileId, FileWatcher, WatchError, file_id};
use rudder_logger::{LogProducer, Message, ReadConfig, tail_offset};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::decoder::LineDecoder;
use crate::error::{JsonFileError, Result};
use crate::file::{Shared, generation_path};
use crate::tempfiles::{TempFileRef, last_timestamp};

/// Reads tried for an unterminated trailing record before giving up.
pub const DECODE_RETRIES: u32 = 20;
const DECODE_RETRY_DELAY: Duration = Duration::from_millis(10);
/// Longest a follower waits without a file event before checking anyway.
pub const FORCED_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const REOPEN_MAX_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Generation {
    Missing,
    OlderThanSince,
    Open(File, Option<TempFileRef>),
}

struct Section {
    file: File,
    start: u64,
    end: u64,
}

enum Change {
    None,
    Rotated,
    Truncated,
}

pub(crate) async fn read_session(shared: Arc<Shared>, config: ReadConfig, producer: LogProducer) {
    match run(&shared, &config, &producer).await {
        Ok(()) => debug!(path = %shared.path.display(), "log read session finished"),
        Err(e) => {
            warn!(path = %shared.path.display(), error = %e, "log read session failed");
            producer.fail(e.into());
        }
    }
}

async fn run(shared: &Shared, config: &ReadConfig, producer: &LogProducer) -> Result<()> {
    if config.tail == 0 && !config.follow {
        return Ok(());
    }

    // Temp file handles stay alive until the session ends.
    let (mut sections, _decompressed) = open_sections(shared, config).await?;
    let Some(current) = sections.pop() else {
        return Ok(());
    };

    for section in sections {
        if drain_history(section, config, producer).await? == Flow::Stop {
            return Ok(());
        }
    }

    let Section { mut file, start, end } = current;
    file.seek(SeekFrom::Start(start)).await?;
    let mut decoder = LineDecoder::new(file.take(end - start), start);
    while let Some(msg) = decoder.next().await? {
        if deliver(msg, config, producer).await == Flow::Stop {
            return Ok(());
        }
    }
    let mut decoder = decoder.map_reader(tokio::io::Take::into_inner);

    if config.follow {
        return follow(shared, decoder, config, producer).await;
    }
    if decoder.has_pending() {
        complete_pending(shared, &mut decoder, config, producer).await?;
    }
    Ok(())
}

/// Opens the files a session needs, oldest first, current file last.
///
/// With a positive tail, older generations are only opened while more
/// lines are still needed.
async fn open_sections(shared: &Shared, config: &ReadConfig) -> Result<(Vec<Section>, Vec<TempFileRef>)> {
    let mut sections = Vec::new();
    let mut decompressed = Vec::new();
    let mut remaining = usize::try_from(config.tail).unwrap_or(0);

    let _rotation = shared.rotate_lock.read().await;

    let current = File::open(&shared.path).await?;
    let size = current.metadata().await?.len();
    sections.push(section_for(current, size, config, &mut remaining).await?);

    if config.tail != 0 {
        for k in 1..shared.config.max_files {
            if config.tail > 0 && remaining == 0 {
                break;
            }
            match open_generation(shared, k, config.since).await? {
                Generation::Open(file, temp) => {
                    let size = file.metadata().await?.len();
                    sections.push(section_for(file, size, config, &mut remaining).await?);
                    decompressed.extend(temp);
                }
                Generation::OlderThanSince => {
                    debug!(generation = k, "skipping generations older than since");
                    break;
                }
                Generation::Missing => break,
            }
        }
    }

    sections.reverse();
    Ok((sections, decompressed))
}

async fn section_for(mut file: File, size: u64, config: &ReadConfig, remaining: &mut usize) -> Result<Section> {
    let start = match config.tail {
        t if t > 0 => {
            let pos = tail_offset(&mut file, size, *remaining).await?;
            *remaining -= pos.lines.min(*remaining);
            pos.offset
        }
        0 => size,
        _ => 0,
    };
    Ok(Section {
        file,
        start,
        end: size,
    })
}

async fn open_generation(shared: &Shared, k: u32, since: Option<DateTime<Utc>>) -> Result<Generation> {
    match File::open(generation_path(&shared.path, k, false)).await {
        Ok(file) => return Ok(Generation::Open(file, None)),
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        Err(_) => {}
    }

    let gz = generation_path(&shared.path, k, true);
    if !tokio::fs::try_exists(&gz).await? {
        return Ok(Generation::Missing);
    }
    if let Some(since) = since {
        if last_timestamp(&gz).await?.is_some_and(|last| since > last) {
            return Ok(Generation::OlderThanSince);
        }
    }

    let temp = shared.decompressed.acquire(&gz).await?;
    let file = File::open(temp.path()).await?;
    Ok(Generation::Open(file, Some(temp)))
}

async fn drain_history(mut section: Section, config: &ReadConfig, producer: &LogProducer) -> Result<Flow> {
    section.file.seek(SeekFrom::Start(section.start)).await?;
    let mut decoder = LineDecoder::new(section.file.take(section.end - section.start), section.start);
    while let Some(msg) = decoder.next().await? {
        if deliver(msg, config, producer).await == Flow::Stop {
            return Ok(Flow::Stop);
        }
    }
    if decoder.has_pending() {
        warn!(offset = decoder.offset(), "discarding truncated record at end of rotated log");
    }
    Ok(Flow::Continue)
}

async fn deliver(msg: Message, config: &ReadConfig, producer: &LogProducer) -> Flow {
    if config.is_before_since(msg.timestamp) {
        return Flow::Continue;
    }
    if config.is_after_until(msg.timestamp) {
        return Flow::Stop;
    }
    if producer.send(msg).await {
        Flow::Continue
    } else {
        Flow::Stop
    }
}

/// Gives a record caught mid-write a bounded number of chances to finish.
async fn complete_pending(
    shared: &Shared,
    decoder: &mut LineDecoder<File>,
    config: &ReadConfig,
    producer: &LogProducer,
) -> Result<()> {
    for _ in 0..DECODE_RETRIES {
        tokio::time::sleep(DECODE_RETRY_DELAY).await;
        if let Some(msg) = decoder.next().await? {
            deliver(msg, config, producer).await;
            return Ok(());
        }
        if !decoder.has_pending() {
            return Ok(());
        }
    }
    Err(JsonFileError::Incomplete {
        path: shared.path.clone(),
        offset: decoder.offset(),
        attempts: DECODE_RETRIES,
    })
}

async fn follow(
    shared: &Shared,
    decoder: LineDecoder<File>,
    config: &ReadConfig,
    producer: &LogProducer,
) -> Result<()> {
    let mut watcher = rudder_filewatch::watch_file(&shared.path)?;
    let result = follow_loop(shared, decoder, watcher.as_mut(), config, producer).await;
    watcher.close().await;
    result
}

async fn follow_loop(
    shared: &Shared,
    mut decoder: LineDecoder<File>,
    watcher: &mut dyn FileWatcher,
    config: &ReadConfig,
    producer: &LogProducer,
) -> Result<()> {
    let mut current_id = handle_id(&mut decoder).await;
    let mut replaced_hint = false;
    let mut store_closed = false;

    loop {
        while let Some(msg) = decoder.next().await? {
            if deliver(msg, config, producer).await == Flow::Stop {
                return Ok(());
            }
        }
        if store_closed {
            return Ok(());
        }
        if config.until.is_some_and(|until| Utc::now() > until) {
            return Ok(());
        }

        match detect_change(shared, &mut decoder, current_id, replaced_hint).await? {
            Change::Rotated => {
                // Whatever reached the old file before the rename comes first.
                while let Some(msg) = decoder.next().await? {
                    if deliver(msg, config, producer).await == Flow::Stop {
                        return Ok(());
                    }
                }
                if decoder.has_pending() {
                    let dropped = decoder.discard_pending();
                    warn!(path = %shared.path.display(), bytes = dropped, "discarding truncated record at rotation");
                }

                let (missed, reopened) = {
                    let _rotation = shared.rotate_lock.read().await;
                    let missed = open_missed_generations(shared, current_id).await?;
                    let reopened = match File::open(&shared.path).await {
                        Ok(file) => Some(file),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                        Err(e) => return Err(e.into()),
                    };
                    (missed, reopened)
                };
                for file in missed {
                    if drain_file(file, config, producer).await? == Flow::Stop {
                        return Ok(());
                    }
                }
                let file = match reopened {
                    Some(file) => file,
                    None => match reopen(shared, producer).await? {
                        Some(file) => file,
                        None => return Ok(()),
                    },
                };
                decoder = LineDecoder::new(file, 0);
                current_id = handle_id(&mut decoder).await;
                replaced_hint = false;

                if let Err(e) = watcher.remove(&shared.path) {
                    debug!(error = %e, "removing stale watch");
                }
                watcher.add(&shared.path)?;
                debug!(path = %shared.path.display(), "follow reopened rotated log");
                continue;
            }
            Change::Truncated => {
                warn!(path = %shared.path.display(), "log file truncated, reading from start");
                decoder.get_mut().seek(SeekFrom::Start(0)).await?;
                decoder.restart_at(0);
                continue;
            }
            Change::None => {}
        }

        let channels = watcher.channels();
        tokio::select! {
            () = producer.consumer_gone() => return Ok(()),
            () = shared.closed.cancelled() => store_closed = true,
            event = channels.events.recv() => match event {
                Some(event) => replaced_hint |= event.op.is_replacement(),
                None => return Err(WatchError::Closed.into()),
            },
            err = channels.errors.recv() => match err {
                Some(e) => warn!(path = %shared.path.display(), error = %e, "file watch error"),
                None => return Err(WatchError::Closed.into()),
            },
            () = tokio::time::sleep(FORCED_CHECK_INTERVAL) => {}
        }
    }
}

/// Opens generations written after the one a follower was reading,
/// oldest first, when it fell behind by more than one rotation.
async fn open_missed_generations(shared: &Shared, old: Option<FileId>) -> Result<Vec<File>> {
    let Some(old) = old else {
        return Ok(Vec::new());
    };

    let mut found = None;
    for k in 1..shared.config.max_files {
        let path = generation_path(&shared.path, k, false);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if file_id(&meta) == Some(old) {
                found = Some(k);
                break;
            }
        }
    }

    // A generation we never saw was deleted: everything retained is newer,
    // unless compression gave it a new identity.
    let newer_than = match found {
        Some(k) => k,
        None if !shared.config.compress => shared.config.max_files,
        None => 1,
    };

    let mut files = Vec::new();
    for j in (1..newer_than).rev() {
        match File::open(generation_path(&shared.path, j, false)).await {
            Ok(file) => files.push(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if found.is_some() {
                    warn!(generation = j, "rotated log gone before follower caught up");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    if !files.is_empty() {
        debug!(count = files.len(), "follower catching up on rotated generations");
    }
    Ok(files)
}

async fn drain_file(file: File, config: &ReadConfig, producer: &LogProducer) -> Result<Flow> {
    let mut decoder = LineDecoder::new(file, 0);
    while let Some(msg) = decoder.next().await? {
        if deliver(msg, config, producer).await == Flow::Stop {
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

async fn handle_id(decoder: &mut LineDecoder<File>) -> Option<FileId> {
    let meta = decoder.get_mut().metadata().await.ok()?;
    file_id(&meta)
}

async fn detect_change(
    shared: &Shared,
    decoder: &mut LineDecoder<File>,
    current_id: Option<FileId>,
    replaced_hint: bool,
) -> Result<Change> {
    let meta = match tokio::fs::metadata(&shared.path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Change::Rotated),
        Err(e) => return Err(e.into()),
    };

    match (file_id(&meta), current_id) {
        (Some(now), Some(ours)) if now != ours => return Ok(Change::Rotated),
        (None, _) | (_, None) if replaced_hint => return Ok(Change::Rotated),
        _ => {}
    }

    let len = decoder.get_mut().metadata().await?.len();
    if len < decoder.position() {
        Ok(Change::Truncated)
    } else {
        Ok(Change::None)
    }
}

async fn reopen(shared: &Shared, producer: &LogProducer) -> Result<Option<File>> {
    let mut delay = Duration::from_millis(10);
    loop {
        match File::open(&shared.path).await {
            Ok(file) => return Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::select! {
            () = producer.consumer_gone() => return Ok(None),
            () = shared.closed.cancelled() => return Ok(None),
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(REOPEN_MAX_DELAY);
    }
}
