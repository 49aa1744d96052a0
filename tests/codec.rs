
use pretty_assertions::assert_eq;

use clist::codec::{self, CmdCursor, CmdSource};
use clist::opcodes::*;
use clist::{CmdRect, ClistError, ColorIndex, NO_COLOR};

#[test]
fn varint_sizes() {
    for &(v, n) in &[(0u32, 1usize), (127, 1), (128, 2), (16383, 2), (16384, 3), (u32::MAX, 5)] {
        let mut out = vec![];
        codec::put_w(v, &mut out);
        assert_eq!(out.len(), n, "value {}", v);
        assert_eq!(codec::size_w(v), n);
        let mut src = CmdCursor::new(&out);
        assert_eq!(src.get_w().unwrap(), v);
        assert!(src.is_empty());
    }
}

#[test]
fn varint_truncated() {
    let data = [0x80u8, 0x80];
    let mut src = CmdCursor::new(&data);
    match src.get_w() {
        Err(ClistError::TruncatedInput { offset, needed }) => {
            assert_eq!(offset, 2);
            assert_eq!(needed, 1);
        },
        other => panic!("expected truncation, got {:?}", other),
    }
}

fn rect_round_trip(prev: CmdRect, rect: CmdRect) -> Vec<u8> {
    let mut out = vec![];
    codec::put_rect(FILL_RECT, &rect, &prev, &mut out);
    let mut src = CmdCursor::new(&out);
    let op = src.get_u8().unwrap();
    let got = match Op::decode(op, 0).unwrap() {
        Op::FillRect(form, n) => codec::get_rect(&mut src, form, n, &prev).unwrap(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(got, rect);
    assert!(src.is_empty());
    out
}

#[test]
fn rect_forms() {
    let prev = CmdRect::new(100, 200, 30, 10);

    // Next to the previous one
    let out = rect_round_trip(prev, CmdRect::new(130, 200, 31, 10));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0] >> 4, FILL_RECT_TINY >> 4);

    let out = rect_round_trip(prev, CmdRect::new(95, 203, 28, 10));
    assert_eq!(out.len(), 2);
    assert_eq!(out[0] >> 4, FILL_RECT_TINY >> 4);

    let out = rect_round_trip(prev, CmdRect::new(150, 200, 60, 12));
    assert_eq!(out.len(), 3);
    assert_eq!(out[0] >> 4, FILL_RECT_SHORT >> 4);

    let out = rect_round_trip(prev, CmdRect::new(50, 300, 90, -50));
    assert_eq!(out.len(), 5);
    assert_eq!(out[0], FILL_RECT_SHORT);

    let out = rect_round_trip(prev, CmdRect::new(1000, 201, 500, 9));
    assert_eq!(out[0] >> 4, FILL_RECT >> 4);
    assert!(out[0] & 15 != 0);

    let out = rect_round_trip(prev, CmdRect::new(5000, 7000, 20, 600));
    assert_eq!(out[0], FILL_RECT);
}

#[test]
fn rect_deltas_out_of_range() {
    let prev = CmdRect::new(i32::MAX - 5, 0, 10, 10);
    // Short form moving 127 to the right
    let mut src = CmdCursor::new(&[0xff, 0x80]);
    assert!(matches!(codec::get_rect(&mut src, RectForm::Short, 8, &prev), Err(ClistError::Malformed { .. })));
    // Tiny form placing the rectangle after the previous one
    let mut src = CmdCursor::new(&[]);
    assert!(matches!(codec::get_rect(&mut src, RectForm::Tiny, 8 | 4, &prev), Err(ClistError::Malformed { .. })));
    // The same deltas from a small origin are fine
    let prev = CmdRect::new(5, 0, 10, 10);
    let mut src = CmdCursor::new(&[0xff, 0x80]);
    assert_eq!(codec::get_rect(&mut src, RectForm::Short, 8, &prev).unwrap(), CmdRect::new(132, 0, 10, 10));
}

#[test]
fn rect_from_origin() {
    rect_round_trip(CmdRect::default(), CmdRect::new(0, 0, 100, 100));
    rect_round_trip(CmdRect::default(), CmdRect::new(-20, -5, 3, 1));
}

fn color_round_trip(prev: ColorIndex, color: ColorIndex, depth: u8) -> usize {
    let mut out = vec![];
    codec::put_color(SET_COLOR1, DELTA2_COLOR1, color, prev, depth, &mut out);
    let mut src = CmdCursor::new(&out);
    let op = src.get_u8().unwrap();
    let got = match Op::decode(op, 0).unwrap() {
        Op::SetColor(1, n) => codec::get_color(&mut src, n, prev, depth).unwrap(),
        Op::Misc(MiscOp::Delta2Color(1)) => codec::get_delta2_color(&mut src, prev, depth).unwrap(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(got, color, "depth {} prev {:x}", depth, prev);
    assert!(src.is_empty());
    out.len()
}

#[test]
fn colors_by_depth() {
    assert_eq!(color_round_trip(0, 1, 1), 1);
    assert_eq!(color_round_trip(1, 0, 1), 1);

    assert_eq!(color_round_trip(100, 103, 8), 1);
    assert_eq!(color_round_trip(100, 93, 8), 1);
    assert_eq!(color_round_trip(100, 107, 8), 2);
    assert_eq!(color_round_trip(0, 255, 8), 2);

    assert_eq!(color_round_trip(0x1234, 0xfedc, 16), 3);

    assert_eq!(color_round_trip(0x102030, 0x112131, 24), 2);
    assert_eq!(color_round_trip(0x102030, 0x1a2b3c, 24), 3);
    assert_eq!(color_round_trip(0x102030, 0xf0e0d0, 24), 4);

    assert_eq!(color_round_trip(0x10203040, 0x11213141, 32), 2);
    assert_eq!(color_round_trip(0x10203040, 0x16263646, 32), 3);
    assert_eq!(color_round_trip(0x10203040, 0xf0e0d0c0, 32), 5);
}

#[test]
fn unchanged_and_no_color() {
    let mut out = vec![];
    codec::put_color(SET_COLOR0, DELTA2_COLOR0, 42, 42, 8, &mut out);
    assert!(out.is_empty());

    assert_eq!(color_round_trip(42, NO_COLOR, 8), 1);
    assert_eq!(color_round_trip(42, NO_COLOR, 24), 1);
    color_round_trip(NO_COLOR, 0x0a0b0c, 24);
    color_round_trip(NO_COLOR, 0x20, 8);
}

#[test]
fn matrices() {
    let mut m = clist::Matrix::new();
    for _ in 0 .. 3 {
        let mut out = vec![];
        codec::put_matrix(&m, &mut out);
        let got = codec::get_matrix(&mut CmdCursor::new(&out)).unwrap();
        assert_eq!(got, m);
        m.translate(12.5, -3.0);
        m.xy = 0.25;
    }

    // Identity: flags and one shared diagonal coefficient
    let mut out = vec![];
    codec::put_matrix(&clist::Matrix::new(), &mut out);
    assert_eq!(out.len(), 1 + 4);

    let mut out = vec![];
    codec::put_matrix(&clist::Matrix::default(), &mut out);
    assert_eq!(out, vec![0]);
}

#[test]
fn segment_operands() {
    let cases: Vec<Vec<i32>> = vec![
        vec![64 * 5, -64 * 3],
        vec![1000, -2000],
        vec![1 << 20, -5],
        vec![1 << 28, -(1 << 27)],
        vec![1 << 30, i32::MIN],
        vec![0, 64, 1001, -1001, 3 << 21, -(1 << 29)],
    ];
    for ops in &cases {
        let mut out = vec![];
        codec::put_segment_operands(ops, &mut out);
        let mut src = CmdCursor::new(&out);
        let got = codec::get_segment_operands(&mut src, ops.len()).unwrap();
        assert_eq!(&got[.. ops.len()], &ops[..]);
        assert!(src.is_empty());
    }

    let mut out = vec![];
    codec::put_segment_operands(&[64 * 7], &mut out);
    assert_eq!(out.len(), 2);
}

#[test]
fn image_headers() {
    use clist::{ColorSpace, ImageHeader, IntRect, ImageFormat};

    let gray = ColorSpace::gray();
    let h = ImageHeader::new(40, 30, 8);
    let mut out = vec![];
    codec::put_image_header(&h, &gray, &mut out).unwrap();
    assert_eq!(codec::get_image_header(&mut CmdCursor::new(&out), &gray).unwrap(), h);

    let mut h = ImageHeader::mask(17, 9);
    h.decode = Some(vec![1.0, 0.0]);
    h.rect = Some(IntRect::new(0, 2, 17, 9));
    let mut out = vec![];
    codec::put_image_header(&h, &gray, &mut out).unwrap();
    assert_eq!(codec::get_image_header(&mut CmdCursor::new(&out), &gray).unwrap(), h);

    let rgb = ColorSpace::rgb();
    let mut h = ImageHeader::new(8, 8, 4);
    h.format = ImageFormat::ComponentPlanar;
    h.interpolate = true;
    h.decode = Some(vec![0.0, 1.0, 0.0, 0.5, 0.2, 1.0]);
    h.matrix = clist::Matrix::from_coeffs([2.0, 0.0, 0.0, 2.0, 10.0, 20.0]);
    let mut out = vec![];
    codec::put_image_header(&h, &rgb, &mut out).unwrap();
    assert_eq!(codec::get_image_header(&mut CmdCursor::new(&out), &rgb).unwrap(), h);

    let bad = ImageHeader::new(8, 8, 3);
    assert!(codec::put_image_header(&bad, &gray, &mut vec![]).is_err());
}

#[test]
fn unassigned_opcodes() {
    for &op in &[0xefu8, 0xf9, 0xfe, 0xff] {
        match Op::decode(op, 77) {
            Err(ClistError::UnrecognizedOpcode { op: o, offset }) => {
                assert_eq!(o, op);
                assert_eq!(offset, 77);
            },
            other => panic!("0x{:02x} decoded as {:?}", op, other),
        }
    }
    assert_eq!(Op::decode(END_PAGE, 0).unwrap(), Op::Misc(MiscOp::EndPage));
    assert_eq!(Op::decode(0x5c, 0).unwrap(), Op::FillRect(RectForm::Tiny, 0xc));
}
