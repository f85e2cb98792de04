//! The flush engine: drains a thread's buffer to its sink.
//!
//! Entered from the block-end clean call, the pre-syscall hook, thread
//! exit, and just before a fork.  A flush inserts the unit header, walks
//! the staged records (optionally rewriting addresses to physical), frames
//! the payload for the sink, and re-seeds the buffer or hands it off.

use std::sync::atomic::Ordering;

use crate::buffer::ThreadData;
use crate::fatal;
use crate::fileops::FlushedBuffer;
use crate::notify;
use crate::pipe::PipeWriter;
use crate::record::{self, RecordType};
use crate::tracer::{Sink, Tracer};

impl Tracer {
    /// The block-end clean call: generated code lands here when the
    /// fullness check reads a non-zero word at the write pointer.
    pub fn clean_call(&self, data: &mut ThreadData) {
        self.memtrace(data, false);
    }

    /// Drain whatever the thread has staged.  `skip_size_cap` forces the
    /// write even over the byte cap, so the thread-exit marker always goes
    /// out.
    pub(crate) fn memtrace(&self, data: &mut ThreadData, skip_size_cap: bool) {
        let entry_size = self.geom.entry_size;
        let hdr_size = self.geom.hdr_size;
        let tid = data.tid;
        let base = data.buffer.as_ref().expect("thread buffer").base();
        let offset = (data.buf_ptr() - base) as usize;
        // Nothing staged: e.g. a syscall flush while the L0 filter holds
        // everything back.
        if offset == hdr_size {
            return;
        }

        let mut header_size = hdr_size;
        if data.num_refs == 0 && self.config.offline {
            // Very first flush of this thread: the slot already carries the
            // initial thread header from thread init.
            header_size = data.init_header_size;
        } else {
            let buffer = data.buffer.as_mut().expect("thread buffer");
            self.encoder.append_unit_header(buffer.as_mut_slice(), tid);
        }

        let cap = self.max_trace_size.load(Ordering::Relaxed);
        let mut do_write = true;
        if !skip_size_cap && cap > 0 && data.bytes_written > cap {
            // Over the limit.  We don't match it exactly (one buffer of
            // slack is allowed) and we keep draining so the buffer state
            // stays consistent; we just stop writing.
            do_write = false;
        } else {
            data.bytes_written += offset as u64;
        }

        let mut handed_off = false;
        if do_write {
            {
                let buffer = data.buffer.as_mut().expect("thread buffer");
                let slice = buffer.as_mut_slice();
                let mut pipe_start = 0usize;
                let mut pipe_end = 0usize;
                let mut rec = header_size;
                while rec < offset {
                    data.num_refs += 1;
                    let typ = record::get_entry_type(&slice[rec..]);
                    if self.translate_physical() {
                        if let Some(typ) = typ {
                            if !typ.is_lifecycle() {
                                // Bundles are disabled under physical
                                // addressing; they may straddle pages.
                                debug_assert!(typ != RecordType::InstrBundle);
                                let virt = record::get_entry_addr(&slice[rec..]);
                                let phys =
                                    self.physaddr.as_ref().unwrap().virtual2physical(virt);
                                if phys != 0 {
                                    record::set_entry_addr(&mut slice[rec..], phys);
                                } else {
                                    // Kernel pages and wild accesses don't
                                    // translate; keep the virtual address.
                                    notify!(
                                        1,
                                        "virtual2physical translation failure for \
                                         <{:2}, {:2}, 0x{:x}>",
                                        typ as u16,
                                        record::get_entry_size(&slice[rec..]),
                                        virt
                                    );
                                }
                            }
                        }
                    }
                    if let Sink::Online { pipe } = &self.sink {
                        // Split the unit into atomic pipe writes, only ever
                        // immediately before an instruction record so an
                        // instruction and its memrefs never part ways.
                        if typ.is_some_and(|t| t.is_instr_fetch()) {
                            if rec - pipe_start > pipe.atomic_write_size() {
                                pipe_start = self.atomic_pipe_write(
                                    pipe.as_ref(),
                                    slice,
                                    pipe_start,
                                    pipe_end,
                                    tid,
                                );
                            }
                            pipe_end = rec;
                        }
                    }
                    rec += entry_size;
                }
                if let Sink::Online { pipe } = &self.sink {
                    // The tail (one instruction plus its memrefs) may still
                    // exceed the ceiling, needing two writes.
                    if offset - pipe_start > pipe.atomic_write_size() {
                        pipe_start = self.atomic_pipe_write(
                            pipe.as_ref(),
                            slice,
                            pipe_start,
                            pipe_end,
                            tid,
                        );
                    }
                    if offset - pipe_start > hdr_size {
                        self.atomic_pipe_write(pipe.as_ref(), slice, pipe_start, offset, tid);
                    }
                }
            }
            if let Sink::Offline { .. } = &self.sink {
                // The reserve buffer must outlive every flush, so a
                // degraded thread writes its exit unit directly instead of
                // handing the reserve off.
                if let (Some(handoff), false) = (&self.file_ops.handoff, data.in_reserve) {
                    // The callback owns the buffer now; we get a fresh one.
                    let buffer = data.buffer.take().expect("thread buffer");
                    let flushed = FlushedBuffer {
                        mem: buffer.into_mem(),
                        valid: offset,
                    };
                    let file = data.file.as_mut().expect("offline thread file");
                    if handoff(file.as_mut(), flushed).is_err() {
                        fatal("failed to hand off trace");
                    }
                    handed_off = true;
                } else {
                    let buffer = data.buffer.as_mut().expect("thread buffer");
                    let slice = &buffer.as_mut_slice()[..offset];
                    let file = data.file.as_mut().expect("offline thread file");
                    let mut written = 0;
                    while written < slice.len() {
                        match file.write(&slice[written..]) {
                            Ok(n) if n > 0 => written += n,
                            _ => fatal("failed to write trace"),
                        }
                    }
                }
            }
        }

        if handed_off {
            self.create_buffer(data);
        } else {
            data.buffer
                .as_mut()
                .expect("thread buffer")
                .reset(offset);
        }
        let base = data.buffer.as_ref().expect("thread buffer").base();
        data.set_buf_ptr(base + hdr_size as u64);
    }

    /// One write to the shared pipe, no larger than the atomic ceiling, and
    /// a re-emitted unit header at the new start so the consumer can resync.
    /// Returns the new start offset.
    pub(crate) fn atomic_pipe_write(
        &self,
        pipe: &dyn PipeWriter,
        slice: &mut [u8],
        start: usize,
        end: usize,
        tid: u32,
    ) -> usize {
        let towrite = end - start;
        debug_assert!(towrite <= pipe.atomic_write_size());
        debug_assert!(towrite > self.geom.hdr_size);
        match pipe.write(&slice[start..end]) {
            Ok(n) if n == towrite => {}
            _ => fatal("failed to write to pipe"),
        }
        let new_start = end - self.geom.hdr_size;
        self.encoder.append_tid(&mut slice[new_start..], tid);
        new_start
    }
}
