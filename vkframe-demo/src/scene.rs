// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Procedurally generated meshes and textures.

use glam::Vec3;
use std::f32::consts::{PI, TAU};
use vkframe::renderer::Vertex;

pub struct Geometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// A cube centered on the origin, with one quad per face so that normals are flat.
pub fn cube(half_extent: f32) -> Geometry {
    let faces = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];
    let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut geometry = Geometry {
        vertices: Vec::with_capacity(24),
        indices: Vec::with_capacity(36),
    };

    for (normal, u_axis, v_axis) in faces {
        let base = geometry.vertices.len() as u32;

        for (u, v) in corners {
            let position = (normal + u_axis * u + v_axis * v) * half_extent;
            geometry.vertices.push(Vertex {
                position: position.to_array(),
                normal: normal.to_array(),
                tex_coord: [(u + 1.0) * 0.5, (1.0 - v) * 0.5],
            });
        }

        geometry
            .indices
            .extend([base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    geometry
}

/// A UV sphere centered on the origin.
///
/// # Panics
///
/// - Panics if `rings < 2` or `segments < 3`.
pub fn sphere(radius: f32, rings: u32, segments: u32) -> Geometry {
    assert!(rings >= 2 && segments >= 3);

    let mut geometry = Geometry {
        vertices: Vec::with_capacity(((rings + 1) * (segments + 1)) as usize),
        indices: Vec::with_capacity((rings * segments * 6) as usize),
    };

    for ring in 0..=rings {
        let v = ring as f32 / rings as f32;
        let (sin_theta, cos_theta) = (v * PI).sin_cos();

        for segment in 0..=segments {
            let u = segment as f32 / segments as f32;
            let (sin_phi, cos_phi) = (u * TAU).sin_cos();
            let normal = Vec3::new(sin_theta * cos_phi, cos_theta, sin_theta * sin_phi);

            geometry.vertices.push(Vertex {
                position: (normal * radius).to_array(),
                normal: normal.to_array(),
                tex_coord: [u, v],
            });
        }
    }

    let stride = segments + 1;
    for ring in 0..rings {
        for segment in 0..segments {
            let a = ring * stride + segment;
            let b = a + stride;
            geometry
                .indices
                .extend([a, a + 1, b, b, a + 1, b + 1]);
        }
    }

    geometry
}

/// A square in the XZ plane facing up.
pub fn ground(half_extent: f32, tiling: f32) -> Geometry {
    let corners = [(-1.0, 1.0), (1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)];

    Geometry {
        vertices: corners
            .iter()
            .map(|&(x, z)| Vertex {
                position: [x * half_extent, 0.0, z * half_extent],
                normal: [0.0, 1.0, 0.0],
                tex_coord: [(x + 1.0) * 0.5 * tiling, (z + 1.0) * 0.5 * tiling],
            })
            .collect(),
        indices: vec![0, 1, 2, 2, 3, 0],
    }
}

/// An RGBA8 checkerboard with its full mip chain, packed level after level.
///
/// Returns the pixels and the number of mip levels.
///
/// # Panics
///
/// - Panics if `size` is not a power of two or `cells` does not divide it.
pub fn checkerboard(size: u32, cells: u32, dark: [u8; 4], light: [u8; 4]) -> (Vec<u8>, u32) {
    assert!(size.is_power_of_two());
    assert!(cells != 0 && size % cells == 0);

    let cell_size = size / cells;
    let mut level: Vec<u8> = (0..size * size)
        .flat_map(|texel| {
            let (x, y) = (texel % size, texel / size);
            if (x / cell_size + y / cell_size) % 2 == 0 {
                dark
            } else {
                light
            }
        })
        .collect();

    let mip_levels = size.ilog2() + 1;
    let mut pixels = level.clone();
    let mut level_size = size;

    while level_size > 1 {
        level = downsample(&level, level_size);
        level_size /= 2;
        pixels.extend_from_slice(&level);
    }

    (pixels, mip_levels)
}

// 2×2 box filter.
fn downsample(level: &[u8], size: u32) -> Vec<u8> {
    let half = size / 2;
    let texel =
        |x: u32, y: u32, channel: u32| level[((y * size + x) * 4 + channel) as usize] as u32;

    (0..half * half)
        .flat_map(|index| {
            let (x, y) = (index % half * 2, index / half * 2);

            (0..4).map(move |channel| {
                let sum = texel(x, y, channel)
                    + texel(x + 1, y, channel)
                    + texel(x, y + 1, channel)
                    + texel(x + 1, y + 1, channel);

                ((sum + 2) / 4) as u8
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_stay_in_range() {
        for geometry in [cube(1.0), sphere(1.0, 8, 12), ground(4.0, 2.0)] {
            let count = geometry.vertices.len() as u32;
            assert_eq!(geometry.indices.len() % 3, 0);
            assert!(geometry.indices.iter().all(|&index| index < count));
        }
    }

    #[test]
    fn checkerboard_mip_chain() {
        let (pixels, mip_levels) = checkerboard(8, 2, [0; 4], [255; 4]);

        assert_eq!(mip_levels, 4);
        assert_eq!(pixels.len(), 4 * (64 + 16 + 4 + 1));
        // The last level averages the whole board.
        assert_eq!(pixels[pixels.len() - 4..], [128; 4]);
    }
}
