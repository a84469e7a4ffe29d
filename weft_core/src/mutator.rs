use crate::io::Buffer;
use std::cell::RefCell;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

/// Byte written for every element of an `ArrayMutator` payload.
const ARRAY_FILL_BYTE: u8 = 0x41;

/// Known-bad strings tried by every `AsciiStringMutator` after its seed.
const BAD_STRINGS: &[&[u8]] = &[
    b"/.../.../.../.../.../.../.../.../.../.../",
    b"/../../../../../../../../../../../../etc/passwd",
    b"/../../../../../../../../../../../../boot.ini",
    b"..:..:..:..:..:..:..:..:..:..:..:..:..:",
    b"\\\\*",
    b"\\\\?\\",
    b"!@#$%%^#$%#$@#$%$$@#$%^^**(()",
    b"%01%02%03%04%0a%0d%0aADSF",
    b"%01%02%03@%04%0a%0d%0aADSF",
    b"/%00/",
    b"%00/",
    b"%00",
    b"%u0000",
    b"%\xfe\xf0%",
    b"1;SELECT%20*",
    b"'sqlattempt1",
    b"(sqlattempt2)",
    b"OR%201=1",
];

/// Overflow probes: (pattern, repeat count).
const OVERFLOW_PROBES: &[(&[u8], usize)] = &[
    (b"A", 128),
    (b"A", 256),
    (b"A", 1024),
    (b"A", 4096),
    (b"A", 65536),
    (b"%n", 64),
    (b"%s", 64),
];

#[derive(Error, Debug)]
pub enum MutatorError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} is empty, nothing to mutate")]
    EmptyInput(String),
}

/// Something that can write its current value into a template buffer.
///
/// Evaluation never changes state: serializing a template any number of
/// times between two mutation steps yields the same bytes.
pub trait Evaluator {
    fn evaluate(&self, buffer: &mut Buffer);
}

/// A stateful generator that enumerates successive variants of a value.
///
/// Mutators are plugged into templates as lazy items and advanced by the
/// campaign controller between executions of the target, never while a
/// template is being serialized.
///
/// The lifecycle is:
/// 1. `reset()` puts the mutator in its first state.
/// 2. The current state is consumed through `Evaluator::evaluate`.
/// 3. `mutate()` moves to the next state. It returns `false` when there is
///    no further state, after which `finished()` reports `true`.
pub trait Mutator: Evaluator + Debug {
    /// Advances to the next state.
    ///
    /// # Returns
    /// `true` if a new state is available to evaluate.
    fn mutate(&mut self) -> bool;

    /// `true` once the enumeration is exhausted. Unbounded generators never
    /// finish and must be limited by the caller.
    fn finished(&self) -> bool;

    /// Returns to the first state.
    fn reset(&mut self);

    /// Human-readable description of the current state, used as the
    /// failure signature when an execution goes wrong.
    fn describe(&self) -> String;
}

/// Mutators are owned by the campaign and referenced by templates.
pub type SharedMutator = Rc<RefCell<dyn Mutator>>;

pub fn share<M: Mutator + 'static>(mutator: M) -> SharedMutator {
    Rc::new(RefCell::new(mutator))
}

/// Fixed-width unsigned integers an `UnsignedMutator` can walk over.
pub trait UnsignedScalar: Copy + Debug + PartialEq + 'static {
    const WIDTH: usize;
    const NAME: &'static str;
    const MIN: Self;
    const MAX: Self;

    fn wrapping_increment(self) -> Self;
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

macro_rules! unsigned_scalar {
    ($ty:ty, $width:expr, $name:expr) => {
        impl UnsignedScalar for $ty {
            const WIDTH: usize = $width;
            const NAME: &'static str = $name;
            const MIN: Self = <$ty>::MIN;
            const MAX: Self = <$ty>::MAX;

            fn wrapping_increment(self) -> Self {
                self.wrapping_add(1)
            }

            fn to_bits(self) -> u64 {
                self as u64
            }

            fn from_bits(bits: u64) -> Self {
                bits as $ty
            }
        }
    };
}

unsigned_scalar!(u8, 1, "u8");
unsigned_scalar!(u16, 2, "u16");
unsigned_scalar!(u32, 4, "u32");
unsigned_scalar!(u64, 8, "u64");

/// Increments an integer on every step, wrapping at the type's width. It
/// never finishes.
#[derive(Debug, Clone)]
pub struct UnsignedMutator<T: UnsignedScalar> {
    initial: T,
    lower: T,
    upper: T,
    current: T,
}

impl<T: UnsignedScalar> UnsignedMutator<T> {
    pub fn new(initial: T) -> Self {
        Self::with_bounds(initial, T::MIN, T::MAX)
    }

    pub fn with_bounds(initial: T, lower: T, upper: T) -> Self {
        Self {
            initial,
            lower,
            upper,
            current: initial,
        }
    }

    pub fn current(&self) -> T {
        self.current
    }

    pub fn bounds(&self) -> (T, T) {
        (self.lower, self.upper)
    }
}

impl<T: UnsignedScalar> Evaluator for UnsignedMutator<T> {
    fn evaluate(&self, buffer: &mut Buffer) {
        buffer.put_uint(self.current.to_bits(), T::WIDTH);
    }
}

impl<T: UnsignedScalar> Mutator for UnsignedMutator<T> {
    fn mutate(&mut self) -> bool {
        self.current = self.current.wrapping_increment();
        true
    }

    fn finished(&self) -> bool {
        false
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    fn describe(&self) -> String {
        format!("{}: current={:?}", T::NAME, self.current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringForm {
    /// `string NUL`
    CString,
    /// `string NUL CR LF`
    Line,
}

/// Walks the seed string followed by a dictionary of known-bad strings.
#[derive(Debug, Clone)]
pub struct AsciiStringMutator {
    form: StringForm,
    dictionary: Vec<Vec<u8>>,
    index: usize,
}

impl AsciiStringMutator {
    pub fn new(form: StringForm, initial: Option<&str>) -> Self {
        let mut dictionary: Vec<Vec<u8>> = Vec::new();
        if let Some(seed) = initial {
            dictionary.push(seed.as_bytes().to_vec());
        }
        dictionary.extend(BAD_STRINGS.iter().map(|s| s.to_vec()));
        dictionary.extend(
            OVERFLOW_PROBES
                .iter()
                .map(|(pattern, count)| pattern.repeat(*count)),
        );
        Self {
            form,
            dictionary,
            index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.dictionary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dictionary.is_empty()
    }

    pub fn current(&self) -> &[u8] {
        self.dictionary
            .get(self.index)
            .or_else(|| self.dictionary.last())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl Evaluator for AsciiStringMutator {
    fn evaluate(&self, buffer: &mut Buffer) {
        buffer.put_slice(self.current());
        buffer.put_u8(0);
        if self.form == StringForm::Line {
            buffer.put_slice(b"\r\n");
        }
    }
}

impl Mutator for AsciiStringMutator {
    fn mutate(&mut self) -> bool {
        if self.finished() {
            return false;
        }
        self.index += 1;
        !self.finished()
    }

    fn finished(&self) -> bool {
        self.index >= self.dictionary.len()
    }

    fn reset(&mut self) {
        self.index = 0;
    }

    fn describe(&self) -> String {
        let form = match self.form {
            StringForm::CString => "cstring",
            StringForm::Line => "line",
        };
        let preview: String = String::from_utf8_lossy(self.current())
            .chars()
            .take(48)
            .collect();
        format!(
            "{form}: index={}/{}, value={preview:?}",
            self.index,
            self.dictionary.len()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePhase {
    BitInverse,
    ByteRemoval,
    Done,
}

/// Two passes over a whole file: invert one byte at a time, then drop one
/// byte at a time.
#[derive(Debug, Clone)]
pub struct FileMutator {
    name: String,
    data: Vec<u8>,
    phase: FilePhase,
    offset: usize,
}

impl FileMutator {
    pub fn from_file(path: &Path) -> Result<Self, MutatorError> {
        let data = std::fs::read(path).map_err(|source| MutatorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(path.display().to_string(), data)
    }

    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Result<Self, MutatorError> {
        let name = name.into();
        if data.is_empty() {
            return Err(MutatorError::EmptyInput(name));
        }
        Ok(Self {
            name,
            data,
            phase: FilePhase::BitInverse,
            offset: 0,
        })
    }

    pub fn phase(&self) -> FilePhase {
        self.phase
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Evaluator for FileMutator {
    fn evaluate(&self, buffer: &mut Buffer) {
        let (before, rest) = self.data.split_at(self.offset.min(self.data.len()));
        match (self.phase, rest.split_first()) {
            (FilePhase::BitInverse, Some((byte, after))) => {
                buffer.put_slice(before);
                buffer.put_u8(!byte);
                buffer.put_slice(after);
            }
            (FilePhase::ByteRemoval, Some((_, after))) => {
                buffer.put_slice(before);
                buffer.put_slice(after);
            }
            _ => {}
        }
    }
}

impl Mutator for FileMutator {
    fn mutate(&mut self) -> bool {
        match self.phase {
            FilePhase::BitInverse => {
                self.offset += 1;
                if self.offset == self.data.len() {
                    self.phase = FilePhase::ByteRemoval;
                    self.offset = 0;
                }
                true
            }
            FilePhase::ByteRemoval => {
                self.offset += 1;
                if self.offset == self.data.len() {
                    self.phase = FilePhase::Done;
                    return false;
                }
                true
            }
            FilePhase::Done => false,
        }
    }

    fn finished(&self) -> bool {
        self.phase == FilePhase::Done
    }

    fn reset(&mut self) {
        self.phase = FilePhase::BitInverse;
        self.offset = 0;
    }

    fn describe(&self) -> String {
        match self.phase {
            FilePhase::BitInverse => {
                format!("file: {:?}, bitinverse, offset={}", self.name, self.offset)
            }
            FilePhase::ByteRemoval => {
                format!("file: {:?}, byteremoval, offset={}", self.name, self.offset)
            }
            FilePhase::Done => format!("file: {:?}, done", self.name),
        }
    }
}

/// Enumerates the element counts of a variable length array.
#[derive(Debug, Clone)]
pub struct ArrayMutator {
    width: usize,
    lower: usize,
    upper: usize,
    count: usize,
    done: bool,
}

impl ArrayMutator {
    pub fn new(width: usize, lower: usize, upper: usize) -> Self {
        Self {
            width,
            lower,
            upper: upper.max(lower),
            count: lower,
            done: false,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Evaluator for ArrayMutator {
    fn evaluate(&self, buffer: &mut Buffer) {
        buffer.put_slice(&vec![ARRAY_FILL_BYTE; self.count * self.width]);
    }
}

impl Mutator for ArrayMutator {
    fn mutate(&mut self) -> bool {
        if self.done || self.count >= self.upper {
            self.done = true;
            return false;
        }
        self.count += 1;
        true
    }

    fn finished(&self) -> bool {
        self.done
    }

    fn reset(&mut self) {
        self.count = self.lower;
        self.done = false;
    }

    fn describe(&self) -> String {
        format!(
            "array: width={}, count={} of {}..={}",
            self.width, self.count, self.lower, self.upper
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ByteOrder;

    fn evaluate(mutator: &dyn Evaluator, order: ByteOrder) -> Vec<u8> {
        let mut buffer = Buffer::new(order);
        mutator.evaluate(&mut buffer);
        buffer.into_vec()
    }

    #[test]
    fn unsigned_mutator_increments_and_wraps() {
        let mut mutator = UnsignedMutator::<u8>::new(254);
        assert_eq!(evaluate(&mutator, ByteOrder::BigEndian), vec![254]);
        assert!(mutator.mutate());
        assert!(mutator.mutate());
        assert_eq!(mutator.current(), 0, "Should wrap at the type's width");
        assert!(!mutator.finished(), "Unsigned mutators never finish");
        mutator.reset();
        assert_eq!(mutator.current(), 254, "Reset restores the initial value");
    }

    #[test]
    fn unsigned_mutator_honors_byte_order() {
        let mutator = UnsignedMutator::<u32>::new(0x0102_0304);
        assert_eq!(
            evaluate(&mutator, ByteOrder::BigEndian),
            vec![1, 2, 3, 4]
        );
        assert_eq!(
            evaluate(&mutator, ByteOrder::LittleEndian),
            vec![4, 3, 2, 1]
        );
        assert_eq!(mutator.describe(), "u32: current=16909060");
    }

    #[test]
    fn ascii_mutator_starts_with_seed_and_walks_dictionary() {
        let mut mutator = AsciiStringMutator::new(StringForm::CString, Some("USER"));
        assert_eq!(evaluate(&mutator, ByteOrder::BigEndian), b"USER\0".to_vec());
        let total = mutator.len();
        assert_eq!(total, 1 + BAD_STRINGS.len() + OVERFLOW_PROBES.len());

        let mut steps = 1;
        while mutator.mutate() {
            steps += 1;
        }
        assert_eq!(steps, total, "Each dictionary entry should be visited once");
        assert!(mutator.finished());

        mutator.reset();
        assert!(!mutator.finished());
        assert_eq!(mutator.current(), b"USER");
    }

    #[test]
    fn ascii_mutator_line_form_appends_crlf() {
        let mut mutator = AsciiStringMutator::new(StringForm::Line, None);
        assert_eq!(mutator.current(), BAD_STRINGS[0]);
        mutator.mutate();
        let mut expected = BAD_STRINGS[1].to_vec();
        expected.extend_from_slice(b"\0\r\n");
        assert_eq!(evaluate(&mutator, ByteOrder::BigEndian), expected);
    }

    #[test]
    fn ascii_mutator_includes_overflow_probes() {
        let mut mutator = AsciiStringMutator::new(StringForm::CString, None);
        let mut longest = 0;
        loop {
            longest = longest.max(mutator.current().len());
            if !mutator.mutate() {
                break;
            }
        }
        assert_eq!(longest, 65536);
    }

    #[test]
    fn file_mutator_rejects_empty_input() {
        match FileMutator::from_bytes("empty", Vec::new()) {
            Err(MutatorError::EmptyInput(name)) => assert_eq!(name, "empty"),
            other => panic!("Expected EmptyInput, got {other:?}"),
        }
    }

    #[test]
    fn file_mutator_rejects_missing_file() {
        let result = FileMutator::from_file(Path::new("/definitely/not/here.bin"));
        assert!(matches!(result, Err(MutatorError::Read { .. })));
    }

    #[test]
    fn file_mutator_runs_two_passes() {
        let data = vec![0x00, 0x0F, 0xF0];
        let mut mutator = FileMutator::from_bytes("three", data.clone()).unwrap();

        let mut seen = vec![evaluate(&mutator, ByteOrder::BigEndian)];
        let mut true_steps = 0;
        while mutator.mutate() {
            true_steps += 1;
            seen.push(evaluate(&mutator, ByteOrder::BigEndian));
        }

        assert_eq!(true_steps, 2 * data.len() - 1);
        assert!(mutator.finished());
        assert_eq!(
            seen,
            vec![
                vec![0xFF, 0x0F, 0xF0],
                vec![0x00, 0xF0, 0xF0],
                vec![0x00, 0x0F, 0x0F],
                vec![0x0F, 0xF0],
                vec![0x00, 0xF0],
                vec![0x00, 0x0F],
            ]
        );
        assert!(!mutator.mutate(), "Done mutators stay done");
    }

    #[test]
    fn file_mutator_reset_and_describe() {
        let mut mutator = FileMutator::from_bytes("x.bin", vec![1, 2]).unwrap();
        assert_eq!(mutator.describe(), "file: \"x.bin\", bitinverse, offset=0");
        mutator.mutate();
        mutator.mutate();
        assert_eq!(mutator.phase(), FilePhase::ByteRemoval);
        assert_eq!(mutator.describe(), "file: \"x.bin\", byteremoval, offset=0");
        mutator.mutate();
        mutator.mutate();
        assert_eq!(mutator.describe(), "file: \"x.bin\", done");
        mutator.reset();
        assert_eq!(mutator.phase(), FilePhase::BitInverse);
        assert_eq!(mutator.offset(), 0);
    }

    #[test]
    fn file_mutator_reads_from_disk() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0xAA]).unwrap();
        let mutator = FileMutator::from_file(file.path()).unwrap();
        assert_eq!(evaluate(&mutator, ByteOrder::BigEndian), vec![0x55]);
    }

    #[test]
    fn array_mutator_enumerates_lengths() {
        let mut mutator = ArrayMutator::new(2, 1, 3);
        let mut lengths = vec![evaluate(&mutator, ByteOrder::BigEndian).len()];
        while mutator.mutate() {
            lengths.push(evaluate(&mutator, ByteOrder::BigEndian).len());
        }
        assert_eq!(lengths, vec![2, 4, 6]);
        assert!(mutator.finished());
        mutator.reset();
        assert_eq!(mutator.count(), 1);
    }
}
