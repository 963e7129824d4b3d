//! Export live remote messages to mbox files, one per folder.
//!
//! Files use the mboxrd convention: every message starts with a
//! `From <sender> <asctime>` line, body lines matching `>*From ` get one
//! more `>`, and each message is followed by a blank line.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{BackupError, Result};
use crate::model::body::LineEnding;
use crate::model::message::{FetchedMessage, MessageRef};
use crate::parser::header::parse_date;
use crate::remote::{FolderFilter, RemoteInventory};
use crate::store::path::local_folder_name;
use crate::store::writer::temp_path_for;

/// Envelope sender used when the `From:` header has no usable address.
const UNKNOWN_SENDER: &str = "MAILER-DAEMON";

/// Statistics returned by an export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExportStats {
    /// Mbox files written.
    pub folders: usize,
    pub messages: u64,
    /// Listed messages whose Message-ID was already exported in the folder.
    pub duplicates: u64,
    /// Messages left out because of a message-scoped error.
    pub skipped: u64,
    pub bytes: u64,
}

/// Path of the mbox file for `folder` below `dir`.
pub fn mbox_path(dir: &Path, folder: &str) -> PathBuf {
    let mut name = local_folder_name(folder);
    name.push_str(".mbox");
    dir.join(name)
}

/// Export every live message admitted by `filter` into `dir`, one mbox file
/// per folder. Existing files are replaced.
///
/// The progress callback receives `(current_folder, total_folders, folder)`.
/// A listing failure or a filesystem error aborts the export; a message that
/// cannot be fetched is skipped.
pub fn export_mailboxes<R: RemoteInventory + ?Sized>(
    remote: &mut R,
    filter: &FolderFilter,
    dir: &Path,
    progress: &dyn Fn(usize, usize, &str),
) -> Result<ExportStats> {
    let refs = remote.list_live(filter)?;
    let folders = group_by_folder(&refs);
    let total = folders.len();
    let mut stats = ExportStats::default();

    for (idx, (folder, messages)) in folders.iter().enumerate() {
        progress(idx, total, folder);
        let target = mbox_path(dir, folder);
        let written = write_mbox(remote, &target, messages, &mut stats)?;
        stats.folders += 1;
        info!(
            folder = %folder,
            path = %target.display(),
            messages = written,
            "Mailbox exported"
        );
    }
    progress(total, total, "done");

    Ok(stats)
}

/// Split a listing into folders, keeping the listing order.
fn group_by_folder(refs: &[MessageRef]) -> Vec<(&str, Vec<&MessageRef>)> {
    let mut groups: Vec<(&str, Vec<&MessageRef>)> = Vec::new();
    for r in refs {
        match groups.iter_mut().find(|(folder, _)| *folder == r.folder) {
            Some((_, list)) => list.push(r),
            None => groups.push((r.folder.as_str(), vec![r])),
        }
    }
    groups
}

/// Write one folder to `<target>~`, then rename it onto `target`.
fn write_mbox<R: RemoteInventory + ?Sized>(
    remote: &mut R,
    target: &Path,
    messages: &[&MessageRef],
    stats: &mut ExportStats,
) -> Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
    }
    let tmp = temp_path_for(target);
    let result = fill_mbox(remote, &tmp, messages, stats).and_then(|written| {
        fs::rename(&tmp, target)
            .map(|()| written)
            .map_err(|e| BackupError::io(target, e))
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn fill_mbox<R: RemoteInventory + ?Sized>(
    remote: &mut R,
    tmp: &Path,
    messages: &[&MessageRef],
    stats: &mut ExportStats,
) -> Result<u64> {
    let file = File::create(tmp).map_err(|e| BackupError::io(tmp, e))?;
    let mut out = BufWriter::new(file);
    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut written = 0;

    for reference in messages {
        let id = reference.message_id.as_str();
        if !id.is_empty() && !seen_ids.insert(id) {
            stats.duplicates += 1;
            continue;
        }

        let fetched = match remote.fetch_body(&reference.folder, id) {
            Ok(fetched) => fetched,
            Err(e) if e.is_message_scoped() => {
                stats.skipped += 1;
                warn!(
                    folder = %reference.folder,
                    message_id = %id,
                    error = %e,
                    "Skipping message"
                );
                continue;
            }
            Err(e) => return Err(e),
        };

        stats.bytes += append_message(&mut out, &fetched).map_err(|e| BackupError::io(tmp, e))?;
        stats.messages += 1;
        written += 1;
    }

    out.flush().map_err(|e| BackupError::io(tmp, e))?;
    Ok(written)
}

/// Append one message in mboxrd form. Returns the number of bytes written.
pub fn append_message<W: Write>(out: &mut W, message: &FetchedMessage) -> std::io::Result<u64> {
    let eol = LineEnding::detect(&message.raw).as_bytes();
    let from_line = format!(
        "From {} {}",
        envelope_sender(&message.reference.from),
        asctime(&message.reference.date)
    );
    out.write_all(from_line.as_bytes())?;
    out.write_all(eol)?;
    let mut written = (from_line.len() + eol.len()) as u64;

    for line in message.raw.split_inclusive(|&b| b == b'\n') {
        if is_from_line(line) {
            out.write_all(b">")?;
            written += 1;
        }
        out.write_all(line)?;
        written += line.len() as u64;
    }

    // Ensure there's a newline separator between messages
    if !message.raw.ends_with(b"\n") {
        out.write_all(eol)?;
        written += eol.len() as u64;
    }
    out.write_all(eol)?;
    written += eol.len() as u64;

    Ok(written)
}

/// `true` for a line that a reader would take for a separator once its
/// leading `>` characters are removed.
fn is_from_line(line: &[u8]) -> bool {
    let quotes = line.iter().take_while(|&&b| b == b'>').count();
    line[quotes..].starts_with(b"From ")
}

/// Bare address of a `From:` value, or `MAILER-DAEMON`.
fn envelope_sender(from: &str) -> &str {
    let addr = match (from.rfind('<'), from.rfind('>')) {
        (Some(open), Some(close)) if open < close => &from[open + 1..close],
        _ => from,
    };
    let addr = addr.trim();
    if addr.contains('@') && !addr.contains(char::is_whitespace) {
        addr
    } else {
        UNKNOWN_SENDER
    }
}

/// `Date:` value as the UTC asctime of a separator line. Unparseable dates
/// fall back to the epoch.
fn asctime(date: &str) -> String {
    parse_date(date)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
        .format("%a %b %e %H:%M:%S %Y")
        .to_string()
}
