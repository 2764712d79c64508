use bytemuck::{Pod, Zeroable};

use crate::my_types::*;

/// `last_index` of a point that has no predecessor in the previous frame.
pub const NO_PREDECESSOR: u32 = u32::MAX;

/// One sparse tracking point as stored in a frame slot.
///
/// Points carry no identity of their own. Correspondence across frames is
/// the `last_index` link into the previous frame's point array.
///
/// Size: 24 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Point {
    /// Current location, subpixel accuracy
    pub x: f32,
    pub y: f32,
    /// Distance from previous location, or zero if new
    pub dx: f32,
    pub dy: f32,
    /// Number of consecutive previous frames this point was seen on
    pub age: u32,
    /// Index in the previous frame's points, or `NO_PREDECESSOR`
    pub last_index: u32,
}

impl Point {
    /// A freshly discovered point.
    pub fn new(x: f32, y: f32) -> Self {
        Point {
            x,
            y,
            dx: 0.,
            dy: 0.,
            age: 0,
            last_index: NO_PREDECESSOR,
        }
    }

    /// The continuation of `previous` (found at `index`) at a new location.
    pub fn tracked(previous: &Point, index: usize, position: Vector2f) -> Self {
        Point {
            x: position.x,
            y: position.y,
            dx: position.x - previous.x,
            dy: position.y - previous.y,
            age: previous.age.saturating_add(1),
            last_index: index as u32,
        }
    }

    pub fn position(&self) -> Vector2f {
        Vector2f::new(self.x, self.y)
    }

    pub fn displacement(&self) -> Vector2f {
        Vector2f::new(self.dx, self.dy)
    }

    pub fn predecessor(&self) -> Option<usize> {
        if self.last_index == NO_PREDECESSOR {
            None
        } else {
            Some(self.last_index as usize)
        }
    }
}
