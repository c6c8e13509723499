//! Line-reorder sink
//!
//! Output lines may arrive out of order (each `WriteLine` is handled on its
//! own thread). The sink buffers by index and writes the longest run starting
//! at the next expected index, so the output stream is always in order.

use crate::protocol::Line;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;

struct State<W> {
    next: u64,
    buffer: HashMap<u64, String>,
    out: W,
}

pub struct ReorderSink<W: Write> {
    state: Mutex<State<W>>,
}

impl<W: Write> ReorderSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            state: Mutex::new(State {
                next: 0,
                buffer: HashMap::new(),
                out,
            }),
        }
    }

    /// Buffer `line` and flush every consecutive line now available
    pub fn write(&self, line: Line) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if line.index < state.next {
            return Ok(());
        }
        state.buffer.insert(line.index, line.text);

        let State { next, buffer, out } = &mut *state;
        let mut wrote = false;
        while let Some(text) = buffer.remove(next) {
            writeln!(out, "{}", text)?;
            *next += 1;
            wrote = true;
        }
        if wrote {
            out.flush()?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.state.into_inner().unwrap_or_else(|e| e.into_inner()).out
    }
}
