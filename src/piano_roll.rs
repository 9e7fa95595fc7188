// Conversion between Standard MIDI Files and piano-rolls.
//
// A piano-roll is a Matrix with one row per time step of `dt` seconds and one column per pitch
// in [lo, hi). An entry is 1.0 while a note of that pitch sounds.
//
// Reading honours tempo changes from any track. Writing produces a single track at 480 ticks
// per quarter note and 120 BPM.

use crate::error::{RnnDbnError, Result};
use crate::matrix::Matrix;
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TICKS_PER_QUARTER: u16 = 480;
const DEFAULT_TEMPO_MICROS: u32 = 500_000;
const NOTE_VELOCITY: u8 = 80;
const TIME_TOLERANCE: f64 = 1e-9;

fn midi_error<E: std::fmt::Display>(e: E) -> RnnDbnError {
    RnnDbnError::Midi(e.to_string())
}

fn check_range(pitch_range: (u8, u8), dt: f64) -> Result<()> {
    let (lo, hi) = pitch_range;
    if hi <= lo || hi > 128 {
        return Err(RnnDbnError::Configuration(format!(
            "invalid pitch range ({}, {})",
            lo, hi
        )));
    }
    if !(dt > 0.0) || !dt.is_finite() {
        return Err(RnnDbnError::Configuration(format!(
            "sampling period {} must be positive",
            dt
        )));
    }
    Ok(())
}

/// Maps absolute ticks to seconds through a tempo map.
struct TempoMap {
    ticks_per_quarter: f64,
    /// (tick, seconds at that tick, seconds per quarter from there on)
    segments: Vec<(u64, f64, f64)>,
}

impl TempoMap {
    fn new(timing: Timing, mut changes: Vec<(u64, u32)>) -> Self {
        let seconds_per_quarter = |micros: u32| micros as f64 / 1_000_000.0;
        match timing {
            // no quarter notes here, count ticks per second instead
            Timing::Timecode(fps, subframes) => TempoMap {
                ticks_per_quarter: fps.as_f32() as f64 * subframes as f64,
                segments: vec![(0, 0.0, 1.0)],
            },
            Timing::Metrical(ticks_per_quarter) => {
                let ticks_per_quarter = ticks_per_quarter.as_int().max(1) as f64;
                changes.sort_by_key(|(tick, _)| *tick);
                let mut segments = vec![(0, 0.0, seconds_per_quarter(DEFAULT_TEMPO_MICROS))];
                for (tick, micros) in changes {
                    let (last_tick, last_secs, last_spq) = segments[segments.len() - 1];
                    let secs = last_secs + (tick - last_tick) as f64 * last_spq / ticks_per_quarter;
                    if tick == last_tick {
                        segments.pop();
                    }
                    segments.push((tick, secs, seconds_per_quarter(micros)));
                }
                TempoMap {
                    ticks_per_quarter,
                    segments,
                }
            }
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        let idx = match self.segments.binary_search_by_key(&tick, |(t, _, _)| *t) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let (start, secs, spq) = self.segments[idx];
        secs + (tick - start) as f64 * spq / self.ticks_per_quarter
    }
}

/// Time step index of an instant. Instants within TIME_TOLERANCE after a step boundary belong
/// to that boundary.
fn step_index(seconds: f64, dt: f64) -> usize {
    (seconds / dt - TIME_TOLERANCE).ceil().max(0.0) as usize
}

/// A note as (pitch, onset seconds, release seconds).
type Note = (u8, f64, f64);

fn collect_notes(smf: &Smf) -> Vec<Note> {
    let mut tempo_changes: Vec<(u64, u32)> = vec![];
    for track in smf.tracks.iter() {
        let mut tick: u64 = 0;
        for event in track.iter() {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Meta(MetaMessage::Tempo(micros)) = &event.kind {
                tempo_changes.push((tick, micros.as_int()));
            }
        }
    }
    let tempo = TempoMap::new(smf.header.timing, tempo_changes);

    let mut notes: Vec<Note> = vec![];
    for track in smf.tracks.iter() {
        let mut tick: u64 = 0;
        let mut sounding: HashMap<(u8, u8), f64> = HashMap::new();
        for event in track.iter() {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Midi { channel, message } = &event.kind {
                let (key, on) = match message {
                    MidiMessage::NoteOn { key, vel } => (key.as_int(), vel.as_int() > 0),
                    MidiMessage::NoteOff { key, .. } => (key.as_int(), false),
                    _ => continue,
                };
                let id = (channel.as_int(), key);
                let now = tempo.seconds(tick);
                // a repeated note-on ends the previous note
                if let Some(onset) = sounding.remove(&id) {
                    notes.push((key, onset, now));
                }
                if on {
                    sounding.insert(id, now);
                }
            }
        }
        if !sounding.is_empty() {
            let end = tempo.seconds(tick);
            for ((_, key), onset) in sounding.into_iter() {
                notes.push((key, onset, end));
            }
        }
    }
    notes
}

/// Parses a Standard MIDI File into a piano-roll.
///
/// A pitch is active at time step t if a note of that pitch is sounding at t*dt. Notes outside
/// the pitch range are dropped.
pub fn midi_to_piano_roll(bytes: &[u8], pitch_range: (u8, u8), dt: f64) -> Result<Matrix> {
    check_range(pitch_range, dt)?;
    let smf = Smf::parse(bytes).map_err(midi_error)?;
    let notes = collect_notes(&smf);
    let (lo, hi) = pitch_range;

    let end = notes.iter().map(|(_, _, release)| *release).fold(0.0, f64::max);
    let steps = step_index(end, dt);
    let mut roll = Matrix::zeros(steps, (hi - lo) as usize);
    for (key, onset, release) in notes.iter() {
        if *key < lo || *key >= hi {
            continue;
        }
        let first = step_index(*onset, dt);
        let last = step_index(*release, dt).min(steps);
        for t in first..last {
            roll.set(t, (key - lo) as usize, 1.0);
        }
    }
    debug!(
        "Parsed {} notes into {} time steps",
        notes.len(),
        roll.rows()
    );
    Ok(roll)
}

/// Builds a single-track Standard MIDI File from a piano-roll. Entries above 0.5 count as
/// sounding.
pub fn piano_roll_to_midi(roll: &Matrix, pitch_range: (u8, u8), dt: f64) -> Result<Vec<u8>> {
    check_range(pitch_range, dt)?;
    let (lo, hi) = pitch_range;
    if roll.cols() != (hi - lo) as usize {
        return Err(RnnDbnError::Configuration(format!(
            "piano-roll has {} columns, pitch range ({}, {}) has {}",
            roll.cols(),
            lo,
            hi,
            hi - lo
        )));
    }

    // 120 BPM: half a second per quarter note
    let seconds_per_tick = DEFAULT_TEMPO_MICROS as f64 / 1_000_000.0 / TICKS_PER_QUARTER as f64;
    let ticks_per_step = (dt / seconds_per_tick).round().max(1.0) as u32;

    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));
    let mut track = vec![TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(DEFAULT_TEMPO_MICROS))),
    }];
    let channel = u4::new(0);
    let sounding = |t: usize, col: usize| t < roll.rows() && roll.at(t, col) > 0.5;

    let mut last_tick: u32 = 0;
    for t in 0..=roll.rows() {
        let tick = t as u32 * ticks_per_step;
        for col in 0..roll.cols() {
            let before = t > 0 && sounding(t - 1, col);
            let now = sounding(t, col);
            if before == now {
                continue;
            }
            let key = u7::new(lo + col as u8);
            let message = if now {
                MidiMessage::NoteOn {
                    key,
                    vel: u7::new(NOTE_VELOCITY),
                }
            } else {
                MidiMessage::NoteOff {
                    key,
                    vel: u7::new(0),
                }
            };
            track.push(TrackEvent {
                delta: u28::new(tick - last_tick),
                kind: TrackEventKind::Midi { channel, message },
            });
            last_tick = tick;
        }
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(track);

    let mut buf = Vec::new();
    smf.write_std(&mut buf)?;
    Ok(buf)
}

pub fn read_midi<P: AsRef<Path>>(path: P, pitch_range: (u8, u8), dt: f64) -> Result<Matrix> {
    let bytes = std::fs::read(path)?;
    midi_to_piano_roll(&bytes, pitch_range, dt)
}

pub fn write_midi<P: AsRef<Path>>(
    path: P,
    roll: &Matrix,
    pitch_range: (u8, u8),
    dt: f64,
) -> Result<()> {
    let bytes = piano_roll_to_midi(roll, pitch_range, dt)?;
    std::fs::write(path, &bytes)?;
    Ok(())
}

/// Loads every .mid/.midi file in a directory, in file name order. Files that contain no notes
/// in the pitch range are skipped.
pub fn load_midi_dir<P: AsRef<Path>>(dir: P, pitch_range: (u8, u8), dt: f64) -> Result<Vec<Matrix>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("mid") || ext.eq_ignore_ascii_case("midi"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut rolls = Vec::with_capacity(paths.len());
    for path in paths.iter() {
        let roll = read_midi(path, pitch_range, dt)?;
        if roll.rows() == 0 || roll.as_slice().iter().all(|x| *x == 0.0) {
            warn!("{} has no notes in range, skipping", path.display());
            continue;
        }
        rolls.push(roll);
    }
    info!(
        "Loaded {} sequences from {}",
        rolls.len(),
        dir.as_ref().display()
    );
    Ok(rolls)
}

/// Thresholds a real-valued piano-roll to 0/1.
pub fn binarize(roll: &Matrix, threshold: f64) -> Matrix {
    let mut result = roll.clone();
    result.map_inplace(|x| if x > threshold { 1.0 } else { 0.0 });
    result
}
