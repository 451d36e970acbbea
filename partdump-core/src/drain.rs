//! Drains process output streams line by line.
//!
//! A process writing to two pipes stalls as soon as either pipe buffer fills,
//! so the two streams of one process are always drained on separate threads
//! while the owning thread waits for exit.
use std::io::{self, BufRead, BufReader, Read};
use std::thread::{self, ScopedJoinHandle};

use crate::error::{DumpError, Result};
use crate::exec::{CommandResult, ProcessHandle};

/// Per-line callback. It runs on the draining thread, not on the caller's.
pub type LineObserver<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Reads `stream` to its end and returns the accumulated text.
///
/// Lines end at `\n`, `\r` or `\r\n`, so carriage-return progress updates are
/// seen one by one. Every line is stored with a trailing `\n` and handed to
/// `on_line` as it arrives. Invalid UTF-8 is replaced, not rejected.
pub fn drain<R: Read>(stream: R, mut on_line: Option<LineObserver<'_>>) -> io::Result<String> {
    let mut reader = BufReader::new(stream);
    let mut text = String::new();
    let mut line = Vec::new();
    let mut after_cr = false;

    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if buf.is_empty() {
            break;
        }

        let consumed = buf.len();
        for &byte in buf {
            match byte {
                b'\n' if after_cr => after_cr = false,
                b'\n' | b'\r' => {
                    emit_line(&mut line, &mut text, &mut on_line);
                    after_cr = byte == b'\r';
                }
                _ => {
                    after_cr = false;
                    line.push(byte);
                }
            }
        }
        reader.consume(consumed);
    }

    if !line.is_empty() {
        emit_line(&mut line, &mut text, &mut on_line);
    }
    Ok(text)
}

fn emit_line(line: &mut Vec<u8>, text: &mut String, on_line: &mut Option<LineObserver<'_>>) {
    let decoded = String::from_utf8_lossy(line);
    text.push_str(&decoded);
    text.push('\n');
    if let Some(observer) = on_line.as_deref_mut() {
        observer(&decoded);
    }
    line.clear();
}

/// Drains both streams of `handle` on their own threads, waits for exit on
/// the current thread and only returns once both drains have been joined.
pub fn drain_and_wait(
    mut handle: ProcessHandle,
    on_stdout: Option<LineObserver<'_>>,
    on_stderr: Option<LineObserver<'_>>,
) -> Result<CommandResult> {
    let command = handle.command().to_string();
    let stdout = handle.take_stdout();
    let stderr = handle.take_stderr();

    thread::scope(|scope| {
        let stdout_task = stdout.map(|stream| scope.spawn(move || drain(stream, on_stdout)));
        let stderr_task = stderr.map(|stream| scope.spawn(move || drain(stream, on_stderr)));

        let exit = handle.wait_for_exit();
        let stdout = join_drain(stdout_task, "stdout drain", &command);
        let stderr = join_drain(stderr_task, "stderr drain", &command);

        let exit_code = exit.map_err(|source| DumpError::Io {
            command: command.clone(),
            source,
        })?;
        Ok(CommandResult {
            exit_code,
            stdout: stdout?,
            stderr: stderr?,
        })
    })
}

fn join_drain(
    task: Option<ScopedJoinHandle<'_, io::Result<String>>>,
    name: &'static str,
    command: &str,
) -> Result<String> {
    let Some(task) = task else {
        return Ok(String::new());
    };
    task.join()
        .map_err(|_| DumpError::TaskPanicked { task: name })?
        .map_err(|source| DumpError::Io {
            command: command.to_string(),
            source,
        })
}
