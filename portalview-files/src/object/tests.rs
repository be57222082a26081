use glam::{Quat, Vec3};

use crate::object::types::{Frame, ObjectId, ObjectKind};

#[test]
fn classification_by_prefix() {
    assert_eq!(ObjectId::leaf(7).kind(), ObjectKind::Leaf);
    assert_eq!(ObjectId::composite(7).kind(), ObjectKind::Composite);
    assert_eq!(ObjectId(0x0500_0001).kind(), ObjectKind::Unknown);
    assert_eq!(ObjectId::leaf(0x0123_4567).0, 0x0123_4567);
}

#[test]
fn frame_applies_scale_then_rotation_then_translation() {
    let frame = Frame {
        origin: Vec3::new(10.0, 0.0, 0.0),
        orientation: Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
        scale: Vec3::splat(2.0),
    };
    let p = frame.to_affine().transform_point3(Vec3::X);
    assert!((p - Vec3::new(10.0, 2.0, 0.0)).length() < 1e-5);
}
