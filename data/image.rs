//! 16-bit grayscale PNG input.

use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("could not open image '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode PNG '{path}': {source}")]
    Decode {
        path: String,
        #[source]
        source: png::DecodingError,
    },
    #[error("could not encode PNG '{path}': {source}")]
    Encode {
        path: String,
        #[source]
        source: png::EncodingError,
    },
    #[error("image '{path}' is {color:?} at {depth:?}; only single-channel 16-bit PNGs are accepted")]
    UnsupportedFormat {
        path: String,
        color: png::ColorType,
        depth: png::BitDepth,
    },
    #[error("image '{path}' is {found_height}x{found_width}, expected {expected_height}x{expected_width}")]
    WrongShape {
        path: String,
        expected_height: usize,
        expected_width: usize,
        found_height: usize,
        found_width: usize,
    },
}

/// Reads a single-channel 16-bit PNG of exactly `shape` (height, width) as raw pixel values.
pub fn load_png16(path: &Path, shape: (usize, usize)) -> Result<Array2<f64>, ImageError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| ImageError::Io {
        path: display.clone(),
        source,
    })?;
    let mut decoder = png::Decoder::new(BufReader::new(file));
    decoder.set_transformations(png::Transformations::IDENTITY);
    let decode_error = |source| ImageError::Decode {
        path: display.clone(),
        source,
    };
    let mut reader = decoder.read_info().map_err(decode_error)?;
    let mut buffer = vec![0u8; reader.output_buffer_size()];
    let frame = reader.next_frame(&mut buffer).map_err(decode_error)?;

    if frame.color_type != png::ColorType::Grayscale || frame.bit_depth != png::BitDepth::Sixteen {
        return Err(ImageError::UnsupportedFormat {
            path: display,
            color: frame.color_type,
            depth: frame.bit_depth,
        });
    }
    let (height, width) = (frame.height as usize, frame.width as usize);
    if (height, width) != shape {
        return Err(ImageError::WrongShape {
            path: display,
            expected_height: shape.0,
            expected_width: shape.1,
            found_height: height,
            found_width: width,
        });
    }

    let bytes = &buffer[..frame.buffer_size()];
    let line = frame.line_size;
    Ok(Array2::from_shape_fn((height, width), |(y, x)| {
        let offset = y * line + 2 * x;
        u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as f64
    }))
}

/// Writes raw pixel values as a single-channel 16-bit PNG. Values are rounded and
/// clamped into the `u16` range.
pub fn save_png16(path: &Path, pixels: &Array2<f64>) -> Result<(), ImageError> {
    let display = path.display().to_string();
    let file = File::create(path).map_err(|source| ImageError::Io {
        path: display.clone(),
        source,
    })?;
    let (height, width) = pixels.dim();
    let mut encoder = png::Encoder::new(BufWriter::new(file), width as u32, height as u32);
    encoder.set_color(png::ColorType::Grayscale);
    encoder.set_depth(png::BitDepth::Sixteen);
    let encode_error = |source| ImageError::Encode {
        path: display.clone(),
        source,
    };
    let mut writer = encoder.write_header().map_err(encode_error)?;
    let data: Vec<u8> = pixels
        .iter()
        .flat_map(|v| (v.round().clamp(0.0, u16::MAX as f64) as u16).to_be_bytes())
        .collect();
    writer.write_image_data(&data).map_err(encode_error)?;
    writer.finish().map_err(encode_error)?;
    Ok(())
}
