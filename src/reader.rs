use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use crate::merge::merge;
use crate::types::*;

// Constants describing the dataset container layout
const DATASET_MAGIC_NUMBER: u32 = 0x5452_4d47;
const FORMAT_VERSION_MAJOR: i16 = 1;
const FORMAT_VERSION_MINOR: i16 = 0;
const EMPTY_STRING_MARKER: u32 = 0xFFFF_FFFF;
const BYTES_PER_VALUE: u64 = 8;
const READ_BUFFER_CAPACITY: usize = 65536;

/// Loads a dataset container file.
///
/// # Arguments
///
/// * `file_path` - Path to the container file
///
/// # Returns
///
/// A `Result` containing either the loaded `Dataset` or a `FileError`.
///
/// # Performance
///
/// This function uses buffered I/O and checks every declared length against
/// the remaining file size before allocating.
pub fn load_file<P: AsRef<Path>>(file_path: P) -> Result<Dataset, FileError> {
    let tic = Instant::now();

    let file = File::open(file_path.as_ref())?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);

    let dataset = read_dataset(&mut reader, file_size)?;

    info!(
        path = %file_path.as_ref().display(),
        channels = dataset.num_channels(),
        trials = dataset.num_trials(),
        elapsed_s = tic.elapsed().as_secs_f64(),
        "loaded dataset"
    );

    Ok(dataset)
}

/// Writes a dataset to a container file, replacing any existing file.
pub fn save_file<P: AsRef<Path>>(dataset: &Dataset, file_path: P) -> Result<(), FileError> {
    dataset.validate(0)?;

    let file = File::create(file_path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_dataset(&mut writer, dataset)?;
    writer.flush()?;

    info!(
        path = %file_path.as_ref().display(),
        channels = dataset.num_channels(),
        trials = dataset.num_trials(),
        "saved dataset"
    );

    Ok(())
}

/// Loads several container files and merges them into one dataset.
///
/// Datasets without a stored name are named after their file path so the
/// merge provenance can identify them.
pub fn load_and_merge_files<P: AsRef<Path>>(
    file_paths: &[P],
    config: &MergeConfig,
) -> Result<Dataset, FileError> {
    if file_paths.len() < 2 {
        return Err(MergeError::InsufficientInput(file_paths.len()).into());
    }

    let mut datasets = Vec::with_capacity(file_paths.len());
    for (i, file_path) in file_paths.iter().enumerate() {
        let file_path = file_path.as_ref();
        debug!(
            file = i + 1,
            total = file_paths.len(),
            path = %file_path.display(),
            "loading file"
        );

        let mut dataset = load_file(file_path)?;
        if dataset.name.is_none() {
            dataset.name = Some(file_path.to_string_lossy().to_string());
        }
        datasets.push(dataset);
    }

    let merged = merge(&datasets, config)?;

    info!(
        files = file_paths.len(),
        channels = merged.num_channels(),
        trials = merged.num_trials(),
        "merged datasets"
    );

    Ok(merged)
}

/// Reads a complete dataset and checks that nothing follows it.
pub(crate) fn read_dataset<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
) -> Result<Dataset, FileError> {
    check_magic_number(reader)?;
    read_version_number(reader)?;

    let name = read_qstring(reader, file_size)?;

    let num_channels = reader.read_u32::<LittleEndian>()? as usize;
    let mut labels = Vec::with_capacity(num_channels.min(4096));
    for _ in 0..num_channels {
        labels.push(read_qstring(reader, file_size)?.unwrap_or_default());
    }

    let num_trials = reader.read_u32::<LittleEndian>()? as usize;
    let mut trials = Vec::with_capacity(num_trials.min(4096));
    let mut time_axes = Vec::with_capacity(num_trials.min(4096));
    for _ in 0..num_trials {
        let (block, axis) = read_trial(reader, num_channels, file_size)?;
        trials.push(block);
        time_axes.push(axis);
    }

    let trial_definition = match reader.read_u8()? {
        0 => None,
        1 => Some(read_trial_definition(reader, file_size)?),
        flag => {
            return Err(FileError::Malformed(format!(
                "invalid trial definition flag {}",
                flag
            )))
        }
    };

    check_end_of_file(file_size, reader)?;

    let dataset = Dataset {
        name,
        labels,
        trials,
        time_axes,
        trial_definition,
        provenance: None,
    };
    dataset.validate(0)?;

    Ok(dataset)
}

/// Writes a complete dataset in container layout.
pub(crate) fn write_dataset<W: Write>(writer: &mut W, dataset: &Dataset) -> Result<(), FileError> {
    writer.write_u32::<LittleEndian>(DATASET_MAGIC_NUMBER)?;
    writer.write_i16::<LittleEndian>(FORMAT_VERSION_MAJOR)?;
    writer.write_i16::<LittleEndian>(FORMAT_VERSION_MINOR)?;

    write_qstring(writer, dataset.name.as_deref())?;

    writer.write_u32::<LittleEndian>(checked_len(dataset.labels.len())?)?;
    for label in &dataset.labels {
        write_qstring(writer, Some(label.as_str()))?;
    }

    writer.write_u32::<LittleEndian>(checked_len(dataset.trials.len())?)?;
    for (block, axis) in dataset.trials.iter().zip(&dataset.time_axes) {
        writer.write_u32::<LittleEndian>(checked_len(axis.len())?)?;
        for &t in axis {
            writer.write_f64::<LittleEndian>(t)?;
        }
        // Logical iteration order is row-major, whatever the memory layout
        for &value in block {
            writer.write_f64::<LittleEndian>(value)?;
        }
    }

    match &dataset.trial_definition {
        Some(definition) => {
            writer.write_u8(1)?;
            writer.write_u32::<LittleEndian>(checked_len(definition.nrows())?)?;
            writer.write_u32::<LittleEndian>(checked_len(definition.ncols())?)?;
            for &value in definition {
                writer.write_f64::<LittleEndian>(value)?;
            }
        }
        None => writer.write_u8(0)?,
    }

    Ok(())
}

fn checked_len(len: usize) -> Result<u32, FileError> {
    u32::try_from(len)
        .map_err(|_| FileError::Malformed(format!("length {} does not fit the container", len)))
}

fn check_magic_number<R: Read>(reader: &mut R) -> Result<(), FileError> {
    let magic_number = reader.read_u32::<LittleEndian>()?;
    if magic_number != DATASET_MAGIC_NUMBER {
        return Err(FileError::UnrecognizedFileFormat);
    }
    Ok(())
}

fn read_version_number<R: Read>(reader: &mut R) -> Result<(), FileError> {
    let major = reader.read_i16::<LittleEndian>()?;
    let minor = reader.read_i16::<LittleEndian>()?;

    if major != FORMAT_VERSION_MAJOR {
        return Err(FileError::UnsupportedVersion { major, minor });
    }

    debug!(major, minor, "reading dataset container");
    Ok(())
}

/// Reads one trial: sample count, time axis, then the channel-major block.
fn read_trial<R: Read + Seek>(
    reader: &mut R,
    num_channels: usize,
    file_size: u64,
) -> Result<(Array2<f64>, Array1<f64>), FileError> {
    let num_samples = reader.read_u32::<LittleEndian>()? as usize;
    ensure_remaining(reader, &[num_channels as u64 + 1, num_samples as u64], file_size)?;

    let axis = read_values(reader, num_samples)?;
    let values = read_values(reader, num_channels * num_samples)?;
    let block = Array2::from_shape_vec((num_channels, num_samples), values)
        .map_err(|e| FileError::Malformed(e.to_string()))?;

    Ok((block, Array1::from_vec(axis)))
}

fn read_trial_definition<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
) -> Result<Array2<f64>, FileError> {
    let rows = reader.read_u32::<LittleEndian>()? as usize;
    let cols = reader.read_u32::<LittleEndian>()? as usize;
    ensure_remaining(reader, &[rows as u64, cols as u64], file_size)?;

    let values = read_values(reader, rows * cols)?;
    Array2::from_shape_vec((rows, cols), values).map_err(|e| FileError::Malformed(e.to_string()))
}

fn read_values<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f64>, FileError> {
    let mut values = vec![0.0; count];
    reader.read_f64_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

/// Fails with `FileSizeError` unless the file holds the product of
/// `dimensions` more `f64` values.
fn ensure_remaining<R: Seek>(
    reader: &mut R,
    dimensions: &[u64],
    file_size: u64,
) -> Result<(), FileError> {
    let needed = dimensions
        .iter()
        .try_fold(BYTES_PER_VALUE, |bytes, &n| bytes.checked_mul(n))
        .ok_or(FileError::FileSizeError)?;
    let current_position = reader.stream_position()?;
    if needed > file_size.saturating_sub(current_position) {
        return Err(FileError::FileSizeError);
    }
    Ok(())
}

/// Reads a length-prefixed UTF-16 string.
///
/// The 4-byte prefix gives the length in bytes; `0xFFFFFFFF` marks an
/// absent string.
fn read_qstring<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
) -> Result<Option<String>, FileError> {
    let length = reader.read_u32::<LittleEndian>()?;

    if length == EMPTY_STRING_MARKER {
        return Ok(None);
    }

    // Verify that the string length is reasonable given remaining file size
    let current_position = reader.stream_position()?;
    if length as u64 > file_size.saturating_sub(current_position) || length % 2 != 0 {
        return Err(FileError::StringReadError);
    }

    let mut units = vec![0u16; (length / 2) as usize];
    reader.read_u16_into::<LittleEndian>(&mut units)?;

    String::from_utf16(&units)
        .map(Some)
        .map_err(|_| FileError::StringReadError)
}

fn write_qstring<W: Write>(writer: &mut W, value: Option<&str>) -> Result<(), FileError> {
    let Some(value) = value else {
        writer.write_u32::<LittleEndian>(EMPTY_STRING_MARKER)?;
        return Ok(());
    };

    let units: Vec<u16> = value.encode_utf16().collect();
    writer.write_u32::<LittleEndian>(checked_len(units.len() * 2)?)?;
    for unit in units {
        writer.write_u16::<LittleEndian>(unit)?;
    }
    Ok(())
}

/// Verifies that the reader sits exactly at the end of the file.
fn check_end_of_file<R: Read + Seek>(file_size: u64, reader: &mut R) -> Result<(), FileError> {
    let current_position = reader.stream_position()?;
    if current_position != file_size {
        return Err(FileError::FileSizeError);
    }
    Ok(())
}
