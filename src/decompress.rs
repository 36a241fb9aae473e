//! Decompression of the image data stored in a XEX container.
//!
//! Only the "basic" scheme is supported: the image is described by a list of
//! runs, each made of `data_size` literal Bytes taken from the input followed
//! by `zero_size` zero Bytes that are not stored at all. The windowed "normal"
//! scheme is rejected with `Error::Unsupported`.

use crate::header::{BasicRun, Compression};
use crate::Error;

/// Shortest run of zeros `compress_basic` turns into a zero fill.
const MIN_ZERO_RUN: usize = 16;

/// Largest image size accepted from the security info (the console's 512 MiB
/// of memory).
pub const MAX_IMAGE_SIZE: u32 = 0x2000_0000;

/// Turns the (decrypted) image data into the flat image.
///
/// Returns `None` for `Compression::Delta`, which stores no image.
pub fn decompress(
    compression: &Compression,
    data: &[u8],
    image_size: u32,
) -> Result<Option<Vec<u8>>, Error> {
    match compression {
        Compression::None => Ok(Some(data.to_vec())),
        Compression::Basic(runs) => expand_basic(runs, data, image_size).map(Some),
        Compression::Normal(_) => Err(Error::Unsupported(
            "normal (windowed) compression".to_string(),
        )),
        Compression::Delta => Ok(None),
    }
}

/// Expands basic compression runs into an `image_size` Byte buffer.
///
/// Literal data is clamped to the input that is actually available. A run
/// reaching past `image_size` is an error, and so is an `image_size` above
/// `MAX_IMAGE_SIZE`. Both are checked before anything is allocated.
pub fn expand_basic(runs: &[BasicRun], input: &[u8], image_size: u32) -> Result<Vec<u8>, Error> {
    if image_size > MAX_IMAGE_SIZE {
        return Err(Error::Malformed(format!(
            "image size {:#X} exceeds the {:#X} Byte limit",
            image_size, MAX_IMAGE_SIZE
        )));
    }

    let covered = runs.iter().try_fold(0u32, |total, run| {
        total
            .checked_add(run.data_size)
            .and_then(|total| total.checked_add(run.zero_size))
            .filter(|total| *total <= image_size)
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "basic compression run {:?} at {:#X} exceeds image size {:#X}",
                    run, total, image_size
                ))
            })
    })?;
    if covered != image_size {
        debug!("runs cover {:#X} of {:#X} image Bytes", covered, image_size);
    }

    let mut image = vec![0; image_size as usize];
    let mut pos_in = 0usize;
    let mut pos_out = 0usize;

    debug!("{} runs, {} Bytes in, {} Bytes out", runs.len(), input.len(), image_size);

    for run in runs {
        trace!("{:?} at out {:#X} in {:#X}", run, pos_out, pos_in);
        let data_size = run.data_size as usize;
        // fits, the total was checked above
        let run_end = pos_out + data_size + run.zero_size as usize;

        let available = input.len().saturating_sub(pos_in).min(data_size);
        if available < data_size {
            debug!("run at {:#X} truncated to {} Bytes of input", pos_out, available);
        }
        if let (Some(src), Some(dest)) = (
            input.get(pos_in..pos_in + available),
            image.get_mut(pos_out..pos_out + available),
        ) {
            dest.copy_from_slice(src);
        }

        pos_out = run_end;
        pos_in = pos_in.saturating_add(data_size);
    }

    Ok(image)
}

/// Splits an image into basic compression runs and the literal data they
/// consume.
///
/// `expand_basic(&runs, &data, image.len())` reproduces `image`.
pub fn compress_basic(image: &[u8]) -> (Vec<BasicRun>, Vec<u8>) {
    let mut runs = Vec::new();
    let mut data = Vec::new();
    let mut literal = 0usize;
    let mut zeros = 0usize;

    for &byte in image {
        if byte == 0 {
            zeros += 1;
            continue;
        }
        if zeros >= MIN_ZERO_RUN {
            runs.push(BasicRun {
                data_size: literal as u32,
                zero_size: zeros as u32,
            });
            literal = 0;
        } else {
            // short zero runs stay literal
            data.extend(std::iter::repeat(0).take(zeros));
            literal += zeros;
        }
        zeros = 0;
        data.push(byte);
        literal += 1;
    }

    if literal != 0 || zeros != 0 {
        runs.push(BasicRun {
            data_size: literal as u32,
            zero_size: zeros as u32,
        });
    }

    (runs, data)
}
