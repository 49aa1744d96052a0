
use pretty_assertions::assert_eq;

use clist::codec::CmdCursor;
use clist::{cfax, rle};
use clist::{choose_bits, read_bits, ClistError, Compression, CompressionMask};

/// Deterministic noise, incompressible by either method
fn noise(n: usize, mut seed: u32) -> Vec<u8> {
    (0 .. n).map(|_| {
        seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
        (seed >> 16) as u8
    }).collect()
}

/// Diagonal stripes with a few isolated dots
fn stripes(raster: usize, height: usize) -> Vec<u8> {
    let mut data = vec![0u8; raster * height];
    for y in 0 .. height {
        for x in 0 .. raster * 8 {
            if (x + y) % 11 < 4 || (x * 7 + y * 3) % 97 == 0 {
                data[y * raster + x / 8] |= 0x80 >> (x % 8);
            }
        }
    }
    data
}

#[test]
fn rle_round_trip() {
    let mut data = vec![7u8; 300];
    data.extend_from_slice(&[1, 2, 3, 4, 5]);
    data.extend(noise(200, 3));
    data.extend_from_slice(&[9, 9, 0, 9]);

    let enc = rle::encode(&data);
    let mut src = CmdCursor::new(&enc);
    assert_eq!(rle::decode(&mut src, data.len()).unwrap(), data);
    assert!(src.is_empty());

    let zeros = vec![0u8; 256];
    assert_eq!(rle::encode(&zeros), vec![129, 0, 129, 0]);
}

#[test]
fn rle_malformed() {
    // literal of 4 into 2 bytes of output
    let data = [3u8, 1, 2, 3, 4];
    match rle::decode(&mut CmdCursor::new(&data), 2) {
        Err(ClistError::Malformed { .. }) => {},
        other => panic!("expected malformed, got {:?}", other),
    }
    // end marker before the output is full
    let data = [128u8];
    assert!(rle::decode(&mut CmdCursor::new(&data), 2).is_err());
    // repeat byte missing
    let data = [200u8];
    match rle::decode(&mut CmdCursor::new(&data), 57) {
        Err(ClistError::TruncatedInput { .. }) => {},
        other => panic!("expected truncation, got {:?}", other),
    }
}

#[test]
fn ccitt_round_trip() {
    for &(raster, height) in &[(1usize, 1usize), (4, 16), (13, 40), (40, 8)] {
        let data = stripes(raster, height);
        let enc = cfax::encode(&data, raster, height);
        let mut src = CmdCursor::new(&enc);
        assert_eq!(cfax::decode(&mut src, raster, height).unwrap(), data, "{}x{}", raster, height);
        assert!(src.is_empty());
    }
}

#[test]
fn ccitt_long_runs() {
    // 3000 columns: runs beyond the largest makeup code
    let raster = 375;
    let mut data = vec![0u8; raster * 3];
    for x in 2800 .. 2990 {
        data[raster + x / 8] |= 0x80 >> (x % 8);
    }
    for b in data[2 * raster ..].iter_mut() {
        *b = 0xff;
    }
    let enc = cfax::encode(&data, raster, 3);
    assert_eq!(cfax::decode(&mut CmdCursor::new(&enc), raster, 3).unwrap(), data);
}

#[test]
fn ccitt_blank_page() {
    let data = vec![0u8; 4 * 64];
    let enc = cfax::encode(&data, 4, 64);
    // One bit a row plus two EOL codes
    assert_eq!(enc.len(), (64 + 24 + 7) / 8);
    assert_eq!(cfax::decode(&mut CmdCursor::new(&enc), 4, 64).unwrap(), data);
}

#[test]
fn ccitt_truncated() {
    let data = stripes(8, 8);
    let enc = cfax::encode(&data, 8, 8);
    let cut = &enc[.. enc.len() / 2];
    assert!(cfax::decode(&mut CmdCursor::new(cut), 8, 8).is_err());
}

#[test]
fn choose_compression() {
    let both = CompressionMask::RLE | CompressionMask::CCITT;
    let blank = vec![0u8; 256];

    let p = choose_bits(&blank, 4, 64, both, 800).unwrap();
    assert_eq!(p.compression, Compression::Ccitt);
    assert_eq!(p.short_size, 256);
    let back = read_bits(&mut CmdCursor::new(&p.data), p.compression, 4, 64).unwrap();
    assert_eq!(back, blank);

    let p = choose_bits(&blank, 4, 64, CompressionMask::RLE, 800).unwrap();
    assert_eq!(p.compression, Compression::Rle);
    assert_eq!(p.data.len(), 4);
    let back = read_bits(&mut CmdCursor::new(&p.data), p.compression, 4, 64).unwrap();
    assert_eq!(back, blank);

    let p = choose_bits(&blank, 4, 64, CompressionMask::empty(), 800).unwrap();
    assert_eq!(p.compression, Compression::None);
    assert_eq!(p.data, blank);

    let rough = noise(256, 11);
    let p = choose_bits(&rough, 4, 64, both, 800).unwrap();
    assert_eq!(p.compression, Compression::None);
    assert_eq!(p.data, rough);

    // Too small to bother
    let p = choose_bits(&blank[.. 40], 4, 10, both, 800).unwrap();
    assert_eq!(p.compression, Compression::None);
}

#[test]
fn payload_limits() {
    let both = CompressionMask::RLE | CompressionMask::CCITT;
    let blank = vec![0u8; 1000];

    match choose_bits(&blank, 10, 100, both, 800) {
        Err(ClistError::BitmapTooLarge { size, limit }) => {
            assert_eq!(size, 1000);
            assert_eq!(limit, 800);
        },
        other => panic!("expected too large, got {:?}", other),
    }

    let p = choose_bits(&blank, 10, 100, both | CompressionMask::DECOMPRESS_ELSEWHERE, 800).unwrap();
    assert_eq!(p.compression, Compression::Ccitt);
    assert!(p.data.len() <= 800);

    let rough = noise(1000, 5);
    assert!(choose_bits(&rough, 10, 100, both | CompressionMask::DECOMPRESS_ELSEWHERE, 800).is_err());
}
