
use pretty_assertions::assert_eq;

use clist::codec;
use clist::opcodes::{SegmentOp, END_PAGE};
use clist::*;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fixed(x: i32, y: i32) -> FixedPoint {
    FixedPoint::new(int2fixed(x), int2fixed(y))
}

fn rect_path(x0: i32, y0: i32, x1: i32, y1: i32) -> Path {
    let mut p = Path::new();
    p.rectangle(int2fixed(x0), int2fixed(y0), int2fixed(x1), int2fixed(y1));
    p
}

fn page_rect(cfg: &ClistConfig) -> IntRect {
    IntRect::new(0, 0, cfg.width, cfg.height)
}

/// Replay every band, calls in band order
fn replay(cfg: &ClistConfig, store: &mut BandStore<std::io::Cursor<Vec<u8>>>) -> Vec<DeviceCall> {
    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    let mut dev = RecordingDevice::new(page_rect(cfg));
    reader.play_page(store, &mut dev).unwrap();
    assert_eq!(reader.state(), ReaderState::EndOfPage);
    dev.take()
}

fn replay_band(cfg: &ClistConfig, store: &mut BandStore<std::io::Cursor<Vec<u8>>>, band: usize) -> Vec<DeviceCall> {
    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    let mut dev = RecordingDevice::new(page_rect(cfg));
    reader.play_band(store, band, &mut dev).unwrap();
    dev.take()
}

#[test]
fn single_rectangle() {
    init_logging();
    let cfg = ClistConfig::new(100, 100, 100, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    writer.fill_rectangle(IntRect::new(0, 0, 100, 100), 0xff).unwrap();
    writer.end_page().unwrap();
    let mut store = writer.into_store();

    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    let mut dev = RecordingDevice::new(IntRect::new(0, 0, 100, 100));
    reader.play_band(&mut store, 0, &mut dev).unwrap();
    assert_eq!(dev.calls, vec![
        DeviceCall::FillRectangle { rect: IntRect::new(0, 0, 100, 100), color: 0xff },
    ]);
    assert_eq!(reader.state(), ReaderState::EndOfPage);
}

#[test]
fn rectangle_split_over_bands() {
    let cfg = ClistConfig::new(100, 100, 25, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    writer.fill_rectangle(IntRect::new(10, 20, 60, 80), 4).unwrap();
    // Off the page: nothing recorded
    writer.fill_rectangle(IntRect::new(200, 0, 300, 50), 5).unwrap();
    // Clipped to the page
    writer.fill_rectangle(IntRect::new(-10, 90, 20, 120), 6).unwrap();
    writer.end_page().unwrap();
    let mut store = writer.into_store();

    assert_eq!(replay(&cfg, &mut store), vec![
        DeviceCall::FillRectangle { rect: IntRect::new(10, 20, 60, 25), color: 4 },
        DeviceCall::FillRectangle { rect: IntRect::new(10, 25, 60, 50), color: 4 },
        DeviceCall::FillRectangle { rect: IntRect::new(10, 50, 60, 75), color: 4 },
        DeviceCall::FillRectangle { rect: IntRect::new(10, 75, 60, 80), color: 4 },
        DeviceCall::FillRectangle { rect: IntRect::new(0, 90, 20, 100), color: 6 },
    ]);
    assert!(replay_band(&cfg, &mut store, 1).len() == 1);
}

#[test]
fn buffer_size_does_not_change_output() {
    let draw = |buffer_size: usize| {
        let cfg = ClistConfig::new(200, 120, 16, 24).with_cbuf_size(256).with_buffer_size(buffer_size);
        let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
        for i in 0 .. 60 {
            let x = (i * 37) % 180;
            let y = (i * 53) % 110;
            let color = 0x010203 * (i as u64 % 9) + 0x100000 * (i as u64 % 3);
            writer.fill_rectangle(IntRect::new(x, y, x + 15, y + 11 + i % 20), color).unwrap();
        }
        writer.end_page().unwrap();
        let mut store = writer.into_store();
        (replay(&cfg, &mut store), store.record_count())
    };
    let (small, small_records) = draw(384);
    let (large, large_records) = draw(64 * 1024);
    assert!(small_records > large_records);
    assert_eq!(small.len(), large.len());
    assert_eq!(small, large);
}

#[test]
fn pages_are_independent() {
    let cfg = ClistConfig::new(50, 50, 25, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    writer.fill_rectangle(IntRect::new(0, 0, 10, 10), 1).unwrap();
    writer.end_page().unwrap();
    assert_eq!(replay(&cfg, writer.store_mut()).len(), 1);

    writer.begin_page().unwrap();
    writer.fill_rectangle(IntRect::new(5, 30, 10, 40), 2).unwrap();
    writer.end_page().unwrap();
    assert_eq!(replay(&cfg, writer.store_mut()), vec![
        DeviceCall::FillRectangle { rect: IntRect::new(5, 30, 10, 40), color: 2 },
    ]);
}

#[test]
fn truncated_stream() {
    init_logging();
    let cfg = ClistConfig::new(2000, 100, 100, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    writer.fill_rectangle(IntRect::new(1500, 10, 1900, 90), 5).unwrap();
    writer.end_page().unwrap();
    let bytes = writer.store_mut().band_bytes(0).unwrap();
    assert_eq!(bytes.last(), Some(&END_PAGE));

    // Cut inside the rectangle's operands
    let cut = &bytes[.. bytes.len() - 2];
    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    let mut dev = RecordingDevice::new(page_rect(&cfg));
    match reader.play_commands(0, cut, &mut dev) {
        Err(ClistError::TruncatedInput { needed, .. }) => assert!(needed >= 1),
        other => panic!("expected truncation, got {:?}", other),
    }
    assert_eq!(reader.state(), ReaderState::Fatal);
    assert!(dev.calls.is_empty());

    // A stream that never reaches end_page is truncated too
    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    match reader.play_commands(0, &bytes[.. bytes.len() - 1], &mut dev) {
        Err(ClistError::TruncatedInput { .. }) => {},
        other => panic!("expected truncation, got {:?}", other),
    }
    assert_eq!(dev.calls.len(), 1);
}

#[test]
fn unrecognized_opcode() {
    let cfg = ClistConfig::new(100, 100, 100, 8);
    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    let mut dev = RecordingDevice::new(page_rect(&cfg));
    match reader.play_commands(0, &[0xfe, END_PAGE], &mut dev) {
        Err(ClistError::UnrecognizedOpcode { op, offset }) => {
            assert_eq!(op, 0xfe);
            assert_eq!(offset, 0);
        },
        other => panic!("expected an unrecognized opcode, got {:?}", other),
    }
    assert_eq!(reader.state(), ReaderState::Fatal);
}

#[test]
fn path_offsets_out_of_range() {
    let cfg = ClistConfig::new(100, 100, 100, 8);
    let mut bytes = vec![SegmentOp::RMoveTo.code()];
    codec::put_segment_operands(&[i32::MAX - 10, 0], &mut bytes);
    bytes.push(SegmentOp::RLineTo.code());
    codec::put_segment_operands(&[1000, 0], &mut bytes);
    bytes.push(END_PAGE);

    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    let mut dev = RecordingDevice::new(page_rect(&cfg));
    match reader.play_commands(0, &bytes, &mut dev) {
        Err(ClistError::Malformed { detail }) => assert!(detail.contains("overflows")),
        other => panic!("expected a malformed path, got {:?}", other),
    }
    assert_eq!(reader.state(), ReaderState::Fatal);
    assert!(dev.calls.is_empty());
}

#[test]
fn device_errors_pass_through() {
    let cfg = ClistConfig::new(100, 100, 100, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    for i in 0 .. 3 {
        writer.fill_rectangle(IntRect::new(i * 10, 0, i * 10 + 5, 5), i as u64).unwrap();
    }
    writer.end_page().unwrap();
    let mut store = writer.into_store();

    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    let mut dev = RecordingDevice::new(page_rect(&cfg)).with_failure_at(1);
    match reader.play_band(&mut store, 0, &mut dev) {
        Err(ClistError::TargetDevice(msg)) => assert!(msg.contains("call 1")),
        other => panic!("expected a device error, got {:?}", other),
    }
    assert_eq!(dev.calls.len(), 1);
    assert_eq!(reader.state(), ReaderState::Fatal);

    assert!(reader.play_band(&mut store, 1, &mut dev).is_err());
}

#[test]
fn fill_path_across_bands() {
    let cfg = ClistConfig::new(100, 100, 25, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let path = rect_path(10, 10, 90, 90);
    let ps = ImagerState::new();
    writer.fill_path(&ps, &path, FillRule::NonZero, &DrawingColor::Pure(7), None).unwrap();
    writer.end_page().unwrap();
    let mut store = writer.into_store();

    let calls = replay(&cfg, &mut store);
    assert_eq!(calls.len(), 4);
    let segs: Vec<Vec<Segment>> = calls.iter().map(|c| match c {
        DeviceCall::FillPath { segments, rule, color, clip, state } => {
            assert_eq!(*rule, FillRule::NonZero);
            assert_eq!(color, &DrawingColor::Pure(7));
            assert_eq!(clip, &None);
            assert_eq!(state, &ps);
            segments.clone()
        },
        other => panic!("unexpected call {:?}", other),
    }).collect();

    // Whole rectangle in the first band
    assert_eq!(segs[0], vec![
        Segment::MoveTo(fixed(10, 10)),
        Segment::LineTo(fixed(90, 10), SN_NONE),
        Segment::LineTo(fixed(90, 90), SN_NONE),
        Segment::LineTo(fixed(10, 90), SN_NONE),
    ]);
    // The second band skips the top edge and joins back to the start
    assert_eq!(segs[1], vec![
        Segment::MoveTo(fixed(90, 10)),
        Segment::LineTo(fixed(90, 90), SN_NONE),
        Segment::LineTo(fixed(10, 90), SN_NONE),
        Segment::LineTo(fixed(10, 10), SN_NONE),
    ]);
}

#[test]
fn path_outside_page_is_dropped() {
    let cfg = ClistConfig::new(100, 100, 50, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let ps = ImagerState::new();
    writer.fill_path(&ps, &rect_path(10, 150, 20, 160), FillRule::EvenOdd, &DrawingColor::Pure(1), None).unwrap();
    writer.fill_path(&ps, &Path::new(), FillRule::EvenOdd, &DrawingColor::Pure(1), None).unwrap();
    writer.end_page().unwrap();
    assert!(replay(&cfg, &mut writer.into_store()).is_empty());
}

#[test]
fn stroke_path_keeps_segments() {
    let cfg = ClistConfig::new(100, 100, 100, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let mut path = Path::new();
    path.move_to(int2fixed(10), int2fixed(10));
    path.line_to(int2fixed(50), int2fixed(10));
    path.line_to(int2fixed(50), int2fixed(50));
    path.close_polygon();
    path.move_to(int2fixed(60), int2fixed(60));
    path.curve_to(fixed(70, 60), fixed(80, 70), fixed(80, 80));
    path.curve_to(fixed(85, 81), fixed(86, 83), fixed(90, 95));

    let ps = ImagerState {
        line_width: 2.0,
        cap: LineCap::Round,
        join: LineJoin::Bevel,
        dash: Dash { pattern: vec![3.0, 1.5], offset: 0.5, .. Dash::default() },
        .. ImagerState::new()
    };
    writer.stroke_path(&ps, &path, &DrawingColor::Pure(200), None).unwrap();
    writer.end_page().unwrap();

    let calls = replay(&cfg, &mut writer.into_store());
    assert_eq!(calls, vec![
        DeviceCall::StrokePath {
            segments: path.segments.clone(),
            color: DrawingColor::Pure(200),
            clip: None,
            state: ps,
        },
    ]);
}

#[test]
fn curve_forms_replay() {
    let cfg = ClistConfig::new(200, 200, 200, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let mut path = Path::new();
    path.move_to(int2fixed(100), int2fixed(100));
    // horizontal start, vertical end, quarter circle both ways
    path.curve_to(fixed(110, 100), fixed(120, 110), fixed(120, 120));
    path.curve_to(fixed(110, 120), fixed(100, 110), fixed(100, 100));
    // vertical start
    path.curve_to(fixed(100, 90), fixed(110, 80), fixed(120, 80));
    path.curve_to(fixed(120, 90), fixed(130, 100), fixed(140, 100));
    // zero first and last offsets
    path.curve_to(fixed(140, 100), fixed(150, 90), fixed(160, 95));
    path.curve_to(fixed(165, 97), fixed(170, 105), fixed(170, 105));
    path.curve_to(fixed(171, 102), fixed(174, 108), fixed(180, 111));
    let ps = ImagerState::new();
    writer.stroke_path(&ps, &path, &DrawingColor::Pure(1), None).unwrap();
    writer.end_page().unwrap();

    match &replay(&cfg, &mut writer.into_store())[..] {
        [DeviceCall::StrokePath { segments, .. }] => assert_eq!(segments, &path.segments),
        other => panic!("unexpected calls {:?}", other),
    }
}

#[test]
fn clip_list_sent_once() {
    let cfg = ClistConfig::new(100, 100, 100, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let clip = ClipPath::new(1, vec![IntRect::new(0, 0, 50, 100)]);
    let ps = ImagerState::new();
    let path = rect_path(10, 10, 90, 90);
    writer.fill_path(&ps, &path, FillRule::NonZero, &DrawingColor::Pure(3), Some(&clip)).unwrap();
    writer.fill_rectangle(IntRect::new(0, 0, 100, 10), 4).unwrap();
    writer.fill_path(&ps, &path, FillRule::NonZero, &DrawingColor::Pure(3), Some(&clip)).unwrap();
    // Everything outside the rectangles
    let outside = ClipPath::outside(2, vec![IntRect::new(0, 0, 100, 50)]);
    writer.fill_path(&ps, &path, FillRule::NonZero, &DrawingColor::Pure(3), Some(&outside)).unwrap();
    writer.end_page().unwrap();

    let calls = replay(&cfg, &mut writer.into_store());
    let clips: Vec<Option<ClipList>> = calls.iter().filter_map(|c| match c {
        DeviceCall::FillPath { clip, .. } => Some(clip.clone()),
        _ => None,
    }).collect();
    let left = ClipList::new(vec![IntRect::new(0, 0, 50, 100)], false);
    assert_eq!(clips, vec![
        Some(left.clone()),
        Some(left),
        Some(ClipList::new(vec![IntRect::new(0, 0, 100, 50)], true)),
    ]);
    assert_eq!(calls[1], DeviceCall::FillRectangle { rect: IntRect::new(0, 0, 100, 10), color: 4 });
}

#[test]
fn clip_covering_band_is_dropped() {
    let cfg = ClistConfig::new(100, 100, 50, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    // Covers the first band entirely, half of the second
    let clip = ClipPath::new(1, vec![IntRect::new(0, 0, 100, 75)]);
    let path = rect_path(10, 10, 90, 90);
    writer.fill_path(&ImagerState::new(), &path, FillRule::NonZero, &DrawingColor::Pure(3), Some(&clip)).unwrap();
    writer.end_page().unwrap();

    let calls = replay(&cfg, &mut writer.into_store());
    let clips: Vec<Option<ClipList>> = calls.iter().filter_map(|c| match c {
        DeviceCall::FillPath { clip, .. } => Some(clip.clone()),
        _ => None,
    }).collect();
    assert_eq!(clips, vec![None, Some(ClipList::new(vec![IntRect::new(0, 0, 100, 75)], false))]);
}

#[test]
fn overlapping_clip_rects_paint_once() {
    let cfg = ClistConfig::new(64, 64, 64, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let clip = ClipPath::new(1, vec![IntRect::new(0, 0, 30, 30), IntRect::new(10, 10, 40, 40)]);
    let mask = vec![0xffu8; 5 * 40];
    writer.fill_mask(Bitmap::new(&mask, 0, 5), None, IntRect::new(0, 0, 40, 40), &DrawingColor::Pure(7), 1, Some(&clip)).unwrap();
    writer.end_page().unwrap();

    let pieces: Vec<IntRect> = replay(&cfg, &mut writer.into_store()).iter().filter_map(|c| match c {
        DeviceCall::CopyMono { rect, colors, .. } => {
            assert_eq!(colors, &[NO_COLOR, 7]);
            Some(*rect)
        },
        _ => None,
    }).collect();
    assert_eq!(pieces, vec![
        IntRect::new(0, 0, 30, 30),
        IntRect::new(10, 30, 40, 40),
        IntRect::new(30, 10, 40, 30),
    ]);
    for (i, a) in pieces.iter().enumerate() {
        for b in &pieces[i + 1 ..] {
            assert_eq!(a.intersect(b), None);
        }
    }
    let area: i32 = pieces.iter().map(|r| r.width() * r.height()).sum();
    assert_eq!(area, 30 * 30 + 30 * 30 - 20 * 20);
}

#[test]
fn clip_union_covering_band_is_dropped() {
    let cfg = ClistConfig::new(100, 100, 50, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    // Neither rectangle covers the first band alone
    let clip = ClipPath::new(1, vec![IntRect::new(0, 0, 60, 50), IntRect::new(40, 0, 100, 60)]);
    let path = rect_path(10, 10, 90, 90);
    writer.fill_path(&ImagerState::new(), &path, FillRule::NonZero, &DrawingColor::Pure(3), Some(&clip)).unwrap();
    writer.end_page().unwrap();

    let calls = replay(&cfg, &mut writer.into_store());
    let clips: Vec<Option<ClipList>> = calls.iter().filter_map(|c| match c {
        DeviceCall::FillPath { clip, .. } => Some(clip.clone()),
        _ => None,
    }).collect();
    assert_eq!(clips, vec![None, Some(ClipList::new(vec![IntRect::new(40, 0, 100, 60)], false))]);
}

#[test]
fn clip_list_covers_union() {
    let band = IntRect::new(0, 0, 100, 50);
    let halves = ClipList::new(vec![IntRect::new(0, 0, 60, 50), IntRect::new(40, 0, 100, 50)], false);
    assert!(halves.covers(&band));
    assert_eq!(halves.rects, vec![IntRect::new(0, 0, 60, 50), IntRect::new(60, 0, 100, 50)]);
    let gap = ClipList::new(vec![IntRect::new(0, 0, 50, 50), IntRect::new(51, 0, 100, 50)], false);
    assert!(!gap.covers(&band));
    let outside = ClipList::new(vec![IntRect::new(0, 60, 100, 80)], true);
    assert!(outside.covers(&band));
    assert_eq!(outside.intersections(&IntRect::new(0, 50, 10, 100)), vec![
        IntRect::new(0, 50, 10, 60),
        IntRect::new(0, 80, 10, 100),
    ]);
}

#[test]
fn logical_op_with_clip() {
    let cfg = ClistConfig::new(64, 16, 16, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let clip = ClipPath::new(4, vec![IntRect::new(0, 0, 8, 16), IntRect::new(4, 0, 12, 16)]);
    let tile = TileBitmap::new(21, 8, 1, 1, vec![0xaa]);
    let ht = DrawingColor::Halftone { tile, colors: [1, 2], phase: (0, 0) };
    let mask = [0xffu8, 0xff];
    writer.set_logical_op(0x5a);
    writer.fill_mask(Bitmap::new(&mask, 0, 2), None, IntRect::new(0, 0, 16, 1), &ht, 1, Some(&clip)).unwrap();
    // Rectangle fills drop the clip and enable the op
    writer.fill_rectangle(IntRect::new(0, 8, 16, 10), 9).unwrap();
    writer.end_page().unwrap();

    let calls = replay(&cfg, &mut writer.into_store());
    assert_eq!(calls.len(), 2);
    match &calls[0] {
        DeviceCall::FillMask { rect, lop, clip, .. } => {
            assert_eq!(*rect, IntRect::new(0, 0, 16, 1));
            assert_eq!(*lop, 0x5a);
            assert_eq!(clip, &Some(ClipList::new(vec![IntRect::new(0, 0, 8, 16), IntRect::new(8, 0, 12, 16)], false)));
        },
        other => panic!("unexpected call {:?}", other),
    }
    assert_eq!(calls[1], DeviceCall::StripCopyRop {
        rect: IntRect::new(0, 8, 16, 10), texture: None, colors: [9, 9], phase: (0, 0), lop: 0x5a,
    });
}

#[test]
fn inline_copies() {
    let cfg = ClistConfig::new(64, 32, 32, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let mono = [0xf0u8, 0x0f, 0xaa, 0x55, 0x81, 0x18, 0xff, 0x00];
    writer.copy_mono(Bitmap::new(&mono, 0, 2), None, IntRect::new(8, 4, 24, 8), 1, 2).unwrap();

    // Starting 3 bits into each row
    let shifted = [0x1e, 0x01, 0xe0, 0x15, 0x4a, 0xa0];
    writer.copy_mono(Bitmap::new(&shifted, 3, 3), None, IntRect::new(30, 10, 46, 12), 0, 9).unwrap();

    let color = [1u8, 2, 3, 4, 5, 6];
    writer.copy_color(Bitmap::new(&color, 0, 3), None, IntRect::new(40, 20, 43, 22)).unwrap();

    let alpha = [0x1b, 0xe4];
    writer.copy_alpha(Bitmap::new(&alpha, 0, 1), None, IntRect::new(0, 0, 4, 2), 77, 2).unwrap();
    writer.end_page().unwrap();

    assert_eq!(replay(&cfg, &mut writer.into_store()), vec![
        DeviceCall::CopyMono { rect: IntRect::new(8, 4, 24, 8), data_x: 0, raster: 2, data: mono.to_vec(), colors: [1, 2] },
        DeviceCall::CopyMono { rect: IntRect::new(30, 10, 46, 12), data_x: 3, raster: 3, data: shifted.to_vec(), colors: [0, 9] },
        DeviceCall::CopyColor { rect: IntRect::new(40, 20, 43, 22), data_x: 0, raster: 3, data: color.to_vec() },
        DeviceCall::CopyAlpha { rect: IntRect::new(0, 0, 4, 2), data_x: 0, raster: 1, data: alpha.to_vec(), color: 77, depth: 2 },
    ]);
}

#[test]
fn wide_copy_is_split() {
    // 1200 pixels of 1 bit rows do not fit one 256 byte reader buffer
    let cfg = ClistConfig::new(1200, 8, 8, 8).with_cbuf_size(256).with_compression(CompressionMask::empty());
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let raster = 150;
    let data: Vec<u8> = (0 .. raster * 4).map(|i| (i * 7 % 256) as u8).collect();
    writer.copy_mono(Bitmap::new(&data, 0, raster), None, IntRect::new(0, 2, 1200, 6), 0, 1).unwrap();
    writer.end_page().unwrap();

    let calls = replay(&cfg, &mut writer.into_store());
    assert!(calls.len() > 1);
    let mut covered = 0;
    for c in &calls {
        match c {
            DeviceCall::CopyMono { rect, data_x, raster: r, data: d, .. } => {
                assert!(d.len() <= 256 - 128);
                assert_eq!(rect.x1, covered);
                // Every copied pixel matches the source
                for y in 0 .. rect.height() as usize {
                    for x in 0 .. rect.width() as usize {
                        let sx = rect.x1 as usize + x;
                        let sy = rect.y1 as usize - 2 + y;
                        let want = data[sy * raster + sx / 8] >> (7 - sx % 8) & 1;
                        let bx = data_x + x;
                        let got = d[y * r + bx / 8] >> (7 - bx % 8) & 1;
                        assert_eq!(got, want, "({}, {})", sx, sy);
                    }
                }
                if rect.y2 == 6 {
                    covered = rect.x2;
                }
            },
            other => panic!("unexpected call {:?}", other),
        }
    }
    assert_eq!(covered, 1200);
}

#[test]
fn cached_copies() {
    let cfg = ClistConfig::new(64, 32, 32, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let mono = [0xf0u8, 0x0f, 0xaa, 0x55, 0x81, 0x18, 0xff, 0x00];
    let bits = Bitmap::new(&mono, 0, 2);
    writer.copy_mono(bits, Some(42), IntRect::new(8, 4, 24, 8), 1, 2).unwrap();
    writer.copy_mono(bits, Some(42), IntRect::new(30, 20, 46, 24), 1, 2).unwrap();
    assert_eq!(writer.tile_cache().len(), 1);
    writer.end_page().unwrap();

    assert_eq!(replay(&cfg, &mut writer.into_store()), vec![
        DeviceCall::CopyMono { rect: IntRect::new(8, 4, 24, 8), data_x: 0, raster: 2, data: mono.to_vec(), colors: [1, 2] },
        DeviceCall::CopyMono { rect: IntRect::new(30, 20, 46, 24), data_x: 0, raster: 2, data: mono.to_vec(), colors: [1, 2] },
    ]);
}

#[test]
fn copy_split_over_bands_is_not_cached() {
    let cfg = ClistConfig::new(32, 32, 4, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let mono = [0xffu8; 16];
    writer.copy_mono(Bitmap::new(&mono, 0, 2), Some(5), IntRect::new(0, 2, 16, 10), 0, 1).unwrap();
    assert!(writer.tile_cache().is_empty());
    writer.end_page().unwrap();

    let rects: Vec<IntRect> = replay(&cfg, &mut writer.into_store()).iter().map(|c| match c {
        DeviceCall::CopyMono { rect, .. } => *rect,
        other => panic!("unexpected call {:?}", other),
    }).collect();
    assert_eq!(rects, vec![IntRect::new(0, 2, 16, 4), IntRect::new(0, 4, 16, 8), IntRect::new(0, 8, 16, 10)]);
}

#[test]
fn compressed_copies() {
    let cfg = ClistConfig::new(256, 64, 64, 8);
    let raster = 32;
    let mut data = vec![0u8; raster * 40];
    for y in 0 .. 40 {
        data[y * raster + y / 4] = 0x80 >> (y % 8);
    }
    let mut results = vec![];
    for &mask in &[CompressionMask::empty(), CompressionMask::RLE, CompressionMask::RLE | CompressionMask::CCITT] {
        let cfg = cfg.clone().with_compression(mask);
        let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
        writer.copy_mono(Bitmap::new(&data, 0, raster), None, IntRect::new(0, 10, 256, 50), 0, 1).unwrap();
        writer.end_page().unwrap();
        let len = writer.store_mut().command_len();
        results.push((replay(&cfg, &mut writer.into_store()), len));
    }
    assert!(results[1].1 < results[0].1);
    assert!(results[2].1 < results[0].1);
    assert_eq!(results[0].0, results[1].0);
    assert_eq!(results[0].0, results[2].0);
}

#[test]
fn fill_mask_with_colors() {
    let cfg = ClistConfig::new(64, 16, 16, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let mask = [0xffu8, 0x81];
    writer.fill_mask(Bitmap::new(&mask, 0, 1), None, IntRect::new(0, 0, 8, 2), &DrawingColor::Pure(5), 1, None).unwrap();

    let tile = TileBitmap::new(77, 8, 1, 1, vec![0xaa]);
    let ht = DrawingColor::Halftone { tile: tile.clone(), colors: [1, 2], phase: (0, 0) };
    writer.fill_mask(Bitmap::new(&mask, 0, 1), None, IntRect::new(16, 4, 24, 6), &ht, 1, None).unwrap();
    let index = writer.tile_cache().find(77).unwrap();

    assert!(writer.fill_mask(Bitmap::new(&mask, 0, 1), None, IntRect::new(0, 0, 8, 2), &DrawingColor::Pure(5), 2, None).is_err());
    writer.end_page().unwrap();

    let cached = TileBitmap { id: index as BitmapId, .. tile.replicated() };
    assert_eq!(replay(&cfg, &mut writer.into_store()), vec![
        DeviceCall::CopyMono { rect: IntRect::new(0, 0, 8, 2), data_x: 0, raster: 1, data: mask.to_vec(), colors: [NO_COLOR, 5] },
        DeviceCall::FillMask {
            rect: IntRect::new(16, 4, 24, 6), data_x: 0, raster: 1, data: mask.to_vec(),
            color: DrawingColor::Halftone { tile: cached, colors: [1, 2], phase: (0, 0) },
            depth: 1, lop: LOP_DEFAULT, clip: None,
        },
    ]);
}

#[test]
fn tiles_and_logical_ops() {
    let cfg = ClistConfig::new(64, 32, 16, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let tile = TileBitmap::new(5, 8, 2, 1, vec![0xf0, 0x0f]);
    writer.strip_tile_rectangle(&tile, IntRect::new(0, 8, 32, 24), 3, 4, (1, 2)).unwrap();
    writer.set_logical_op(LOP_DEFAULT | LOP_S_TRANSPARENT);
    writer.fill_rectangle(IntRect::new(0, 0, 10, 10), 9).unwrap();
    writer.set_logical_op(LOP_DEFAULT);
    writer.fill_rectangle(IntRect::new(0, 0, 10, 10), 9).unwrap();
    let index = writer.tile_cache().find(5).unwrap();
    writer.end_page().unwrap();

    let cached = TileBitmap { id: index as BitmapId, .. tile.replicated() };
    let lop = LOP_DEFAULT | LOP_S_TRANSPARENT;
    assert_eq!(replay(&cfg, &mut writer.into_store()), vec![
        // band 0
        DeviceCall::StripTileRectangle { rect: IntRect::new(0, 8, 32, 16), tile: cached.clone(), colors: [3, 4], phase: (1, 2) },
        DeviceCall::StripCopyRop { rect: IntRect::new(0, 0, 10, 10), texture: None, colors: [9, 9], phase: (1, 2), lop },
        DeviceCall::FillRectangle { rect: IntRect::new(0, 0, 10, 10), color: 9 },
        // band 1
        DeviceCall::StripTileRectangle { rect: IntRect::new(0, 16, 32, 24), tile: cached, colors: [3, 4], phase: (1, 2) },
    ]);
}

#[test]
fn uncacheable_tile_becomes_copies() {
    let cfg = ClistConfig::new(64, 16, 16, 8).with_tile_cache(64, 16);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    // 16x8 of 1 bit is 16 bytes, replicated well past the 32 byte limit
    let data: Vec<u8> = (0 .. 16u8).map(|i| i.wrapping_mul(29)).collect();
    let tile = TileBitmap::new(8, 16, 8, 1, data);
    writer.strip_tile_rectangle(&tile, IntRect::new(0, 0, 40, 12), 0, 1, (0, 0)).unwrap();
    assert!(writer.tile_cache().is_empty());
    writer.end_page().unwrap();

    let calls = replay(&cfg, &mut writer.into_store());
    assert!(!calls.is_empty());
    let mut area = 0;
    for c in &calls {
        match c {
            DeviceCall::CopyMono { rect, data_x, raster, data, colors } => {
                assert_eq!(colors, &[0, 1]);
                area += rect.width() * rect.height();
                for y in rect.y1 .. rect.y2 {
                    for x in rect.x1 .. rect.x2 {
                        let bx = data_x + (x - rect.x1) as usize;
                        let by = (y - rect.y1) as usize;
                        let got = u32::from(data[by * raster + bx / 8] >> (7 - bx % 8) & 1);
                        assert_eq!(got, tile.pixel(x, y, (0, 0)), "({}, {})", x, y);
                    }
                }
            },
            other => panic!("unexpected call {:?}", other),
        }
    }
    assert_eq!(area, 40 * 12);
}

#[test]
fn images_over_bands() {
    let cfg = ClistConfig::new(64, 32, 16, 8).with_cbuf_size(256);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let mut header = ImageHeader::new(64, 5, 8);
    header.matrix = Matrix::new();
    let ps = ImagerState { ctm: Matrix::from_coeffs([1.0, 0.0, 0.0, 1.0, 0.0, 14.0]), .. ImagerState::new() };
    let rows: Vec<u8> = (0 .. 64 * 5).map(|i| (i % 251) as u8).collect();

    writer.begin_image(&ps, &header, &ColorSpace::gray(), &DrawingColor::Pure(0), None).unwrap();
    assert!(writer.begin_image(&ps, &header, &ColorSpace::gray(), &DrawingColor::Pure(0), None).is_err());
    writer.image_data(&[Bitmap::new(&rows, 0, 64)], 5).unwrap();
    writer.end_image().unwrap();
    assert!(writer.end_image().is_err());
    writer.end_page().unwrap();

    let calls = replay(&cfg, &mut writer.into_store());
    let begin = DeviceCall::BeginImage {
        header: header.clone(), color_space: ColorSpace::gray(), color: DrawingColor::Pure(NO_COLOR), clip: None,
    };
    let data = |r0: usize, n: usize| DeviceCall::ImageData {
        planes: vec![rows[r0 * 64 .. (r0 + n) * 64].to_vec()], data_x: 0, raster: 64, height: n as u32,
    };
    // 128 bytes of room: two rows at a time
    let band = vec![begin, data(0, 2), data(2, 2), data(4, 1), DeviceCall::EndImage];
    let mut both = band.clone();
    both.extend(band);
    assert_eq!(calls, both);
}

#[test]
fn image_mask_color() {
    let cfg = ClistConfig::new(16, 16, 16, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    let mut header = ImageHeader::mask(8, 2);
    header.matrix = Matrix::new();
    let ps = ImagerState::new();
    let tile = TileBitmap::new(1, 8, 1, 1, vec![0x55]);
    let ht = DrawingColor::Halftone { tile, colors: [0, 1], phase: (0, 0) };
    assert!(writer.begin_image(&ps, &header, &ColorSpace::gray(), &ht, None).is_err());

    writer.begin_image(&ps, &header, &ColorSpace::gray(), &DrawingColor::Pure(33), None).unwrap();
    writer.image_data(&[Bitmap::new(&[0xf0, 0x0f], 0, 1)], 2).unwrap();
    // end_page closes the open image
    writer.end_page().unwrap();

    assert_eq!(replay(&cfg, &mut writer.into_store()), vec![
        DeviceCall::BeginImage { header, color_space: ColorSpace::gray(), color: DrawingColor::Pure(33), clip: None },
        DeviceCall::ImageData { planes: vec![vec![0xf0, 0x0f]], data_x: 0, raster: 1, height: 2 },
        DeviceCall::EndImage,
    ]);
}

#[test]
fn images_disabled() {
    let cfg = ClistConfig::new(16, 16, 16, 8).with_high_level_images(false);
    let mut writer = ClistWriter::new(cfg, BandStore::memory()).unwrap();
    let header = ImageHeader::new(4, 4, 8);
    match writer.begin_image(&ImagerState::new(), &header, &ColorSpace::gray(), &DrawingColor::Pure(0), None) {
        Err(ClistError::ImagesDisabled) => {},
        other => panic!("expected images disabled, got {:?}", other),
    }
    assert!(!writer.is_disabled());
}

#[test]
fn page_wide_state() {
    let cfg = ClistConfig::new(16, 32, 16, 8);
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap();
    writer.put_params(&[1, 2, 3]).unwrap();
    let map: Vec<u16> = (0 .. TRANSFER_MAP_SIZE as u16).map(|v| v * 257).collect();
    writer.set_transfer_map(2, Some(map.clone())).unwrap();
    writer.set_transfer_map(3, None).unwrap();
    assert!(writer.set_transfer_map(1, Some(vec![0; 3])).is_err());

    let levels: Vec<u32> = (0 .. 30).collect();
    let bits: Vec<HtBit> = (0 .. 20).map(|i| HtBit { offset: i, mask: 1 << (i % 32) }).collect();
    let ht = DeviceHalftone::new(1, HtOrder::new(4, 4, 1, 0).with_levels(levels.clone()).with_bits(bits.clone()))
        .with_component(7, HtOrder::new(2, 2, 1, 1).with_levels(vec![0, 1, 2, 3]).with_bits(bits[.. 4].to_vec()));
    writer.set_halftone(&ht).unwrap();
    // Unchanged, not sent again
    writer.set_halftone(&ht).unwrap();
    writer.end_page().unwrap();
    let mut store = writer.into_store();

    let expect = vec![
        DeviceCall::PutParams(vec![1, 2, 3]),
        DeviceCall::InstallTransfer { index: 2, map: Some(map) },
        DeviceCall::InstallTransfer { index: 3, map: None },
        DeviceCall::InstallHalftone(ht),
    ];
    assert_eq!(replay_band(&cfg, &mut store, 0), expect);
    assert_eq!(replay_band(&cfg, &mut store, 1), expect);
}

#[test]
fn band_out_of_range() {
    let cfg = ClistConfig::new(16, 32, 16, 8);
    let mut store = BandStore::memory();
    let mut reader = ClistReader::new(cfg.clone()).unwrap();
    let mut dev = RecordingDevice::new(page_rect(&cfg));
    assert!(reader.play_band(&mut store, 2, &mut dev).is_err());
}
