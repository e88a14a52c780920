//! Mathematical types used in the wire protocol. These are the canonical
//!  representations pushed into and popped out of message bodies.

/// 3D vector, three f32 components on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}
impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Vector3 {
        Vector3 { x, y, z }
    }

    pub const ZERO: Vector3 = Vector3::new(0.0, 0.0, 0.0);
}

/// Double-precision 3D vector, used for global coordinates
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vector3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}
impl Vector3d {
    pub const fn new(x: f64, y: f64, z: f64) -> Vector3d {
        Vector3d { x, y, z }
    }
}

/// 4D vector, four f32 components on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vector4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}
impl Vector4 {
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Vector4 {
        Vector4 { x, y, z, w }
    }
}

/// Rotation quaternion. Only the vector part travels on the wire; the scalar
///  component is reconstructed from the unit-length invariant on receipt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}
impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Quaternion {
        Quaternion { x, y, z, w }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }

    /// Unit-length copy of self. A degenerate (zero-length or non-finite)
    ///  quaternion normalizes to the identity.
    pub fn normalized(&self) -> Quaternion {
        let len = self.length();
        if len.is_finite() && len > f32::EPSILON {
            Quaternion::new(self.x / len, self.y / len, self.z / len, self.w / len)
        }
        else {
            Quaternion::IDENTITY
        }
    }
}
impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::IDENTITY
    }
}
