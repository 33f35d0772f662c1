//! Compaction
//!
//! Merges a window of segments into fewer, larger ones, keeping only the
//! newest entry for every key.
//!
//! ## Process
//! 1. Pick a window of whole compaction groups (`plan_*`)
//! 2. Stream the inputs through a k-way merge, newest input first
//! 3. Write outputs, splitting at `target_segment_bytes`
//! 4. Swap inputs for outputs in the segment list, then delete inputs
//!
//! All outputs of one run form a group: they share the sequence of the
//! newest input and the group id of the first output; the last one carries
//! the final-part flag. Recovery uses that to tell a finished compaction
//! from an interrupted one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::manager::{SegmentHandle, SegmentList, StorageManager};
use super::segment::{SegmentMeta, SegmentWriter};
use crate::codec::Key;
use crate::config::CompactionStrategy;
use crate::error::{LsmError, Result};
use crate::merge::{EntryIter, MergeIterator};

/// Records merged between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Cooperative stop flags for a running compaction
#[derive(Debug, Default)]
pub struct CompactionControl {
    cancel: AtomicBool,
    shutdown: AtomicBool,
}

impl CompactionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the current run; later runs proceed normally
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stop the current run and refuse new ones
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Clear a cancel request before starting a run
    pub fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.is_shutdown()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(LsmError::Compaction("compaction cancelled".to_string()));
        }
        Ok(())
    }
}

/// Segments chosen for one compaction run
pub struct CompactionPlan<K> {
    /// Inputs, newest first
    pub inputs: Vec<Arc<SegmentHandle<K>>>,
    /// Window reaches the oldest segment, so no older data can be shadowed
    pub drop_tombstones: bool,
}

impl<K: Key> CompactionPlan<K> {
    pub fn input_ids(&self) -> Vec<u64> {
        self.inputs.iter().map(|h| h.file_id()).collect()
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(|h| h.size_bytes()).sum()
    }
}

/// Outcome of a finished compaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    pub input_segments: usize,
    pub output_segments: usize,
    pub records_written: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub tombstones_dropped: bool,
    pub duration: Duration,
}

// =============================================================================
// Planning
// =============================================================================

/// Segments sharing a group id, in list order (newest first)
struct Group<K> {
    members: Vec<Arc<SegmentHandle<K>>>,
    damaged: bool,
    bytes: u64,
}

fn group_segments<K: Key>(list: &SegmentList<K>) -> Vec<Group<K>> {
    let mut groups: Vec<Group<K>> = Vec::new();
    let mut position: HashMap<u64, usize> = HashMap::new();

    for handle in list.iter() {
        match handle.group_id() {
            Some(group_id) => {
                let idx = *position.entry(group_id).or_insert_with(|| {
                    groups.push(Group {
                        members: Vec::new(),
                        damaged: false,
                        bytes: 0,
                    });
                    groups.len() - 1
                });
                groups[idx].bytes += handle.size_bytes();
                groups[idx].members.push(Arc::clone(handle));
            }
            None => groups.push(Group {
                members: vec![Arc::clone(handle)],
                damaged: true,
                bytes: 0,
            }),
        }
    }
    groups
}

fn plan_from_groups<K: Key>(groups: &[Group<K>], start: usize, len: usize) -> CompactionPlan<K> {
    let window = &groups[start..start + len];
    CompactionPlan {
        inputs: window.iter().flat_map(|g| g.members.iter().cloned()).collect(),
        drop_tombstones: start + len == groups.len(),
    }
}

/// Merge everything into one group
///
/// `Ok(None)` when there is nothing to do: fewer than two segments, or the
/// whole list is already the output of one compaction.
pub fn plan_full<K: Key>(list: &SegmentList<K>) -> Result<Option<CompactionPlan<K>>> {
    if let Some(damaged) = list.iter().find(|h| h.is_damaged()) {
        return Err(LsmError::Compaction(format!(
            "cannot compact past damaged segment {}",
            damaged.path().display()
        )));
    }
    let groups = group_segments(list);
    if list.len() < 2 || groups.len() < 2 {
        return Ok(None);
    }
    Ok(Some(plan_from_groups(&groups, 0, groups.len())))
}

/// Pick up to `fan_in` adjacent groups according to `strategy`
///
/// Windows containing a damaged segment are never chosen.
pub fn plan_automatic<K: Key>(
    list: &SegmentList<K>,
    fan_in: usize,
    strategy: CompactionStrategy,
) -> Option<CompactionPlan<K>> {
    let groups = group_segments(list);
    let width = fan_in.min(groups.len());
    if width < 2 {
        return None;
    }

    let candidates = (0..=groups.len() - width)
        .filter(|&start| !groups[start..start + width].iter().any(|g| g.damaged));

    let start = match strategy {
        CompactionStrategy::OldestFirst => candidates.max()?,
        CompactionStrategy::SmallestFirst => {
            let bytes = |start: usize| -> u64 {
                groups[start..start + width].iter().map(|g| g.bytes).sum()
            };
            // Ties go to the older window
            candidates.min_by_key(|&start| (bytes(start), std::cmp::Reverse(start)))?
        }
    };
    Some(plan_from_groups(&groups, start, width))
}

// =============================================================================
// Execution
// =============================================================================

/// Run `plan` to completion and publish the result
///
/// On any failure (cancellation included) the outputs written so far are
/// removed and the inputs stay published and untouched.
pub fn run<K: Key>(
    manager: &StorageManager<K>,
    plan: CompactionPlan<K>,
    target_segment_bytes: u64,
    control: &CompactionControl,
) -> Result<CompactionStats> {
    let started = Instant::now();
    let mut outputs: Vec<Arc<SegmentHandle<K>>> = Vec::new();

    let written = match write_outputs(manager, &plan, target_segment_bytes, control, &mut outputs) {
        Ok(written) => written,
        Err(e) => {
            manager.remove_files(&outputs);
            return Err(e.into_compaction());
        }
    };

    if let Err(e) = manager.replace(&plan.input_ids(), outputs.clone()) {
        manager.remove_files(&outputs);
        return Err(e.into_compaction());
    }

    // Oldest first, so a crash part-way leaves only the newest inputs
    let stale: Vec<_> = plan.inputs.iter().rev().cloned().collect();
    manager.remove_files(&stale);

    let stats = CompactionStats {
        input_segments: plan.inputs.len(),
        output_segments: outputs.len(),
        records_written: written,
        bytes_before: plan.input_bytes(),
        bytes_after: outputs.iter().map(|h| h.size_bytes()).sum(),
        tombstones_dropped: plan.drop_tombstones,
        duration: started.elapsed(),
    };
    tracing::info!(
        inputs = stats.input_segments,
        outputs = stats.output_segments,
        records = stats.records_written,
        bytes_before = stats.bytes_before,
        bytes_after = stats.bytes_after,
        duration_ms = stats.duration.as_millis() as u64,
        "Compaction finished"
    );
    Ok(stats)
}

fn write_outputs<K: Key>(
    manager: &StorageManager<K>,
    plan: &CompactionPlan<K>,
    target_segment_bytes: u64,
    control: &CompactionControl,
    outputs: &mut Vec<Arc<SegmentHandle<K>>>,
) -> Result<u64> {
    control.check()?;

    let sequence = plan.inputs.iter().map(|h| h.sequence()).max().unwrap_or(0);
    let mut base_sequence = sequence;
    let mut sources: Vec<EntryIter<K>> = Vec::with_capacity(plan.inputs.len());
    for handle in &plan.inputs {
        let reader = handle.reader()?;
        base_sequence = base_sequence.min(reader.descriptor().base_sequence);
        sources.push(Box::new(reader.iter()?));
    }

    tracing::info!(
        inputs = plan.inputs.len(),
        sequence,
        base_sequence,
        drop_tombstones = plan.drop_tombstones,
        "Compaction started"
    );

    let drop_tombstones = plan.drop_tombstones;
    let mut merged = MergeIterator::new(sources)
        .filter(move |record| {
            !(drop_tombstones && record.as_ref().is_ok_and(|(_, entry)| entry.is_tombstone()))
        })
        .peekable();

    let mut writer: Option<(u64, SegmentWriter<K>)> = None;
    let mut group_id = 0;
    let mut part_index = 0u32;
    let mut written = 0u64;

    while let Some(record) = merged.next() {
        let (key, entry) = record?;

        written += 1;
        if written % CANCEL_CHECK_INTERVAL == 0 {
            control.check()?;
        }

        let (file_id, mut current) = match writer.take() {
            Some(open) => open,
            None => {
                let (file_id, path) = manager.allocate(sequence);
                if part_index == 0 {
                    group_id = file_id;
                }
                let meta = SegmentMeta {
                    sequence,
                    base_sequence,
                    group_id,
                    part_index,
                };
                (file_id, SegmentWriter::create(&path, meta)?)
            }
        };
        current.add(&key, &entry)?;

        if current.estimated_size() >= target_segment_bytes && merged.peek().is_some() {
            control.check()?;
            outputs.push(finish_part(manager, file_id, current, false)?);
            part_index += 1;
        } else {
            writer = Some((file_id, current));
        }
    }

    if let Some((file_id, last)) = writer.take() {
        control.check()?;
        outputs.push(finish_part(manager, file_id, last, true)?);
    }
    Ok(written)
}

fn finish_part<K: Key>(
    manager: &StorageManager<K>,
    file_id: u64,
    writer: SegmentWriter<K>,
    is_final_part: bool,
) -> Result<Arc<SegmentHandle<K>>> {
    let path = writer.path().to_path_buf();
    writer.finish(is_final_part)?;
    manager.open_handle(file_id, &path)
}
