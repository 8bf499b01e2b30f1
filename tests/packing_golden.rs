//! Golden tests for the rectangle packer.
//!
//! These tests pin exact layouts and check the packing invariants over
//! arbitrary request sequences.

use proptest::prelude::*;
use thumbnail_atlas::{PackError, Placement, Rect, RectPacker, SheetId, Size};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn sheet(n: u128) -> SheetId {
    SheetId::new(Uuid::from_u128(n))
}

fn run(sheet_size: Size, requests: &[Size]) -> (RectPacker, Vec<Placement>) {
    let mut packer = RectPacker::with_sequential_ids(sheet_size, 1);
    let placements = requests
        .iter()
        .map(|size| packer.place(*size).unwrap())
        .collect();
    (packer, placements)
}

fn assert_valid_layout(packer: &RectPacker) {
    for id in packer.sheet_ids() {
        let bounds = packer.sheet_dimensions(&id).unwrap();
        let rects = packer.occupied(&id);
        for (i, a) in rects.iter().enumerate() {
            assert!(a.is_within(bounds), "{a} leaves {bounds} sheet {id}");
            for b in &rects[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b} on sheet {id}");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Golden Layouts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_golden_two_thumbnails_then_more() {
    // 80×60 sources fitted into 50×50.
    let thumb = Size::new(80, 60).fit_within(Size::new(50, 50));
    assert_eq!(thumb, Size::new(50, 37));

    let (packer, placements) = run(Size::new(100, 100), &[thumb; 5]);
    let got: Vec<(SheetId, Rect)> = placements.iter().map(|p| (p.sheet, p.rect)).collect();
    assert_eq!(
        got,
        vec![
            (sheet(1), Rect::new(0, 0, 50, 37)),
            (sheet(1), Rect::new(50, 0, 50, 37)),
            (sheet(1), Rect::new(50, 37, 50, 37)),
            (sheet(1), Rect::new(0, 37, 50, 37)),
            (sheet(2), Rect::new(0, 0, 50, 37)),
        ]
    );
    assert_valid_layout(&packer);
}

#[test]
fn test_golden_short_sheet_overflows_on_third() {
    let thumb = Size::new(50, 37);
    let (_, placements) = run(Size::new(100, 40), &[thumb; 3]);
    assert_eq!(placements[1].rect, Rect::new(50, 0, 50, 37));
    assert!(placements[2].new_sheet);
    assert_eq!(placements[2].sheet, sheet(2));
}

#[test]
fn test_golden_mixed_sizes() {
    let requests = [
        Size::new(60, 40),
        Size::new(30, 30),
        Size::new(40, 20),
        Size::new(10, 50),
        Size::new(60, 40),
    ];
    let (packer, placements) = run(Size::new(100, 100), &requests);
    let rects: Vec<Rect> = placements.iter().map(|p| p.rect).collect();
    assert_eq!(
        rects,
        vec![
            Rect::new(0, 0, 60, 40),
            Rect::new(60, 0, 30, 30),
            Rect::new(60, 40, 40, 20),
            Rect::new(50, 40, 10, 50),
            Rect::new(0, 0, 60, 40),
        ]
    );
    assert_eq!(placements[4].sheet, sheet(2));
    assert_eq!(packer.sheet_count(), 2);
    assert_valid_layout(&packer);
}

#[test]
fn test_oversized_request_rejected_without_side_effects() {
    let mut packer = RectPacker::with_sequential_ids(Size::new(100, 100), 1);
    packer.place(Size::new(10, 10)).unwrap();
    let before = packer.layout_fingerprint();

    assert_eq!(
        packer.place(Size::new(101, 10)),
        Err(PackError::Oversized {
            requested: Size::new(101, 10),
            sheet: Size::new(100, 100),
        })
    );
    assert_eq!(packer.layout_fingerprint(), before);
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

fn request() -> impl Strategy<Value = Size> {
    (1u32..=64, 1u32..=64).prop_map(|(w, h)| Size::new(w, h))
}

proptest! {
    #[test]
    fn prop_placements_never_overlap(requests in prop::collection::vec(request(), 1..60)) {
        let (packer, placements) = run(Size::new(128, 128), &requests);
        assert_valid_layout(&packer);
        for (placement, size) in placements.iter().zip(&requests) {
            prop_assert_eq!(placement.rect.size(), *size);
        }
        let recorded: usize = packer.sheet_ids().map(|id| packer.occupied(&id).len()).sum();
        prop_assert_eq!(recorded, requests.len());
    }

    #[test]
    fn prop_packing_is_deterministic(requests in prop::collection::vec(request(), 1..40)) {
        let (a, first) = run(Size::new(128, 128), &requests);
        let (b, second) = run(Size::new(128, 128), &requests);
        prop_assert_eq!(first, second);
        prop_assert_eq!(a.layout_fingerprint(), b.layout_fingerprint());
    }

    #[test]
    fn prop_fit_stays_inside_box(
        src_w in 1u32..4000, src_h in 1u32..4000,
        box_w in 1u32..512, box_h in 1u32..512,
    ) {
        let fitted = Size::new(src_w, src_h).fit_within(Size::new(box_w, box_h));
        prop_assert!(!fitted.is_empty());
        prop_assert!(Size::new(box_w, box_h).contains(fitted));
    }
}
