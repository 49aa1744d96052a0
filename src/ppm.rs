//! PNG files of rendered pages
//!
//! Thin wrappers over the `image` crate, used to keep rendered output and
//! compare it against a reference.
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{ClistError, Result};

fn image_error(e: image::ImageError) -> ClistError {
    match e {
        image::ImageError::IoError(e) => ClistError::Io(e),
        e => ClistError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

/// RGB pixels, width and height of an image file
pub fn read_file<P: AsRef<Path>>(filename: P) -> Result<(Vec<u8>,usize,usize)> {
    let img = image::open(filename).map_err(image_error)?.to_rgb();
    let (w, h) = img.dimensions();
    Ok((img.into_raw(), w as usize, h as usize))
}

/// Save 8 bit RGB pixels, the format follows the file extension
pub fn write_file<P: AsRef<Path>>(buf: &[u8], width: usize, height: usize, filename: P) -> Result<()> {
    image::save_buffer(filename, buf, width as u32, height as u32, image::RGB(8))?;
    Ok(())
}

/// True if both files hold the same pixels
pub fn img_diff<P: AsRef<Path>>(f1: P, f2: P) -> Result<bool> {
    let (d1,w1,h1) = read_file(f1)?;
    let (d2,w2,h2) = read_file(f2)?;
    if w1 != w2 || h1 != h2 {
        debug!(w1, h1, w2, h2, "image sizes differ");
        return Ok(false);
    }
    let mut flag = true;
    for (i,(v1,v2)) in d1.iter().zip(d2.iter()).enumerate() {
        if v1 != v2 {
            warn!(x = (i/3)%w1, y = (i/3)/w1, c = i%3, v1, v2, "pixel differs");
            flag = false;
        }
    }
    Ok(flag)
}
