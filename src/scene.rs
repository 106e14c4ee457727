// Scene data
//
// CPU-side geometry, texture pixels and per-frame uniforms. Everything here
// is plain data; the renderer uploads it.

use crate::backend::{RenderError, RenderResult, VertexLayout};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::io::BufRead;
use std::mem::{offset_of, size_of};
use std::path::Path;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn layout() -> VertexLayout {
        VertexLayout::new(size_of::<Self>() as u32)
            .attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, pos) as u32)
            .attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, color) as u32)
            .attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv) as u32)
    }
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { pos: [-0.5, -0.5, 0.0], color: [1.0, 0.0, 0.0], uv: [1.0, 0.0] },
    Vertex { pos: [0.5, -0.5, 0.0], color: [0.0, 1.0, 0.0], uv: [0.0, 0.0] },
    Vertex { pos: [0.5, 0.5, 0.0], color: [0.0, 0.0, 1.0], uv: [0.0, 1.0] },
    Vertex { pos: [-0.5, 0.5, 0.0], color: [1.0, 1.0, 1.0], uv: [1.0, 1.0] },
];

pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Indexed triangle list.
#[derive(Clone, Debug, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn quad() -> Self {
        Self {
            vertices: QUAD_VERTICES.to_vec(),
            indices: QUAD_INDICES.to_vec(),
        }
    }

    /// Load every model in a Wavefront OBJ file into one mesh. Faces are
    /// triangulated, vertices are white, and V is flipped to Vulkan's
    /// top-left texture origin. Materials are ignored.
    pub fn load_obj(path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let (models, _materials) = tobj::load_obj(path, &obj_load_options())
            .map_err(|e| RenderError::Asset(format!("loading {}: {e}", path.display())))?;
        let mesh = Self::from_models(&models)?;
        log::info!(
            "Loaded {} ({} vertices, {} triangles)",
            path.display(),
            mesh.vertices.len(),
            mesh.indices.len() / 3
        );
        Ok(mesh)
    }

    pub fn from_obj_reader(reader: &mut impl BufRead) -> RenderResult<Self> {
        let (models, _materials) =
            tobj::load_obj_buf(reader, &obj_load_options(), |_| Err(tobj::LoadError::OpenFileFailed))
                .map_err(|e| RenderError::Asset(format!("parsing OBJ: {e}")))?;
        Self::from_models(&models)
    }

    fn from_models(models: &[tobj::Model]) -> RenderResult<Self> {
        let mut mesh = Self {
            vertices: Vec::new(),
            indices: Vec::new(),
        };

        for model in models {
            let base = mesh.vertices.len() as u32;
            let positions = &model.mesh.positions;
            let texcoords = &model.mesh.texcoords;

            for (i, pos) in positions.chunks_exact(3).enumerate() {
                let uv = match texcoords.get(2 * i..2 * i + 2) {
                    Some(&[u, v]) => [u, 1.0 - v],
                    _ => [0.0, 0.0],
                };
                mesh.vertices.push(Vertex {
                    pos: [pos[0], pos[1], pos[2]],
                    color: [1.0, 1.0, 1.0],
                    uv,
                });
            }
            mesh.indices.extend(model.mesh.indices.iter().map(|&i| base + i));
        }

        if mesh.indices.is_empty() {
            return Err(RenderError::Asset("model has no faces".into()));
        }
        if let Some(&bad) = mesh.indices.iter().find(|&&i| i as usize >= mesh.vertices.len()) {
            return Err(RenderError::Asset(format!(
                "index {bad} out of range for {} vertices",
                mesh.vertices.len()
            )));
        }
        Ok(mesh)
    }
}

fn obj_load_options() -> tobj::LoadOptions {
    tobj::LoadOptions {
        single_index: true,
        triangulate: true,
        ..Default::default()
    }
}

/// Tightly packed RGBA8 pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureData {
    pub extent: vk::Extent2D,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn checkerboard(size: u32, cells: u32) -> Self {
        Self {
            extent: vk::Extent2D {
                width: size,
                height: size,
            },
            pixels: checkerboard(size, cells),
        }
    }

    /// Decode any image file the `image` crate understands into RGBA8.
    pub fn load(path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .map_err(|e| RenderError::Asset(format!("loading {}: {e}", path.display())))?
            .into_rgba8();
        let (width, height) = decoded.dimensions();
        log::info!("Loaded {} ({}x{})", path.display(), width, height);
        Ok(Self {
            extent: vk::Extent2D { width, height },
            pixels: decoded.into_raw(),
        })
    }
}

/// Layout matches the vertex shader's std140 uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub view: Mat4,
    pub proj: Mat4,
}

/// Per-draw vertex-stage push constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DrawConstants {
    pub model: Mat4,
}

/// What the application hands the renderer each frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneData {
    /// Seconds since start; drives the model's rotation.
    pub time: f32,
    pub clear_color: [f32; 4],
}

impl Default for SceneData {
    fn default() -> Self {
        Self {
            time: 0.0,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl SceneData {
    pub fn uniforms(&self, extent: vk::Extent2D) -> UniformBufferObject {
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down.
        proj.y_axis.y *= -1.0;

        UniformBufferObject {
            view: Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z),
            proj,
        }
    }

    pub fn draw_constants(&self) -> DrawConstants {
        DrawConstants {
            model: Mat4::from_rotation_z(self.time * 90f32.to_radians()),
        }
    }
}

/// RGBA8 checkerboard, `cells` squares per side.
pub fn checkerboard(size: u32, cells: u32) -> Vec<u8> {
    let cell = (size / cells.max(1)).max(1);
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let v = if light { 230 } else { 40 };
            pixels.extend_from_slice(&[v, v, v, 255]);
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SQUARE_OBJ: &str = "\
v -1.0 -1.0 0.0
v 1.0 -1.0 0.0
v 1.0 1.0 0.0
v -1.0 1.0 0.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
f 1/1 2/2 3/3 4/4
";

    #[test]
    fn vertex_layout_matches_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.stride, 32);
        let offsets: Vec<u32> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }

    #[test]
    fn quad_indices_stay_in_range() {
        let quad = Mesh::quad();
        assert!(quad.indices.iter().all(|&i| (i as usize) < quad.vertices.len()));
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&quad.vertices).len(), 4 * 32);
    }

    #[test]
    fn obj_quad_is_triangulated_with_flipped_v() {
        let mesh = Mesh::from_obj_reader(&mut Cursor::new(SQUARE_OBJ)).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < 4));
        assert_eq!(mesh.vertices[0].pos, [-1.0, -1.0, 0.0]);
        assert_eq!(mesh.vertices[0].uv, [0.0, 1.0]);
        assert_eq!(mesh.vertices[2].uv, [1.0, 0.0]);
        assert_eq!(mesh.vertices[1].color, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn obj_without_faces_is_an_asset_error() {
        let err = Mesh::from_obj_reader(&mut Cursor::new("v 0.0 0.0 0.0\n")).unwrap_err();
        assert!(matches!(err, RenderError::Asset(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn missing_model_file_is_an_asset_error() {
        let err = Mesh::load_obj("does/not/exist.obj").unwrap_err();
        assert!(matches!(err, RenderError::Asset(ref msg) if msg.contains("exist.obj")));
    }

    #[test]
    fn png_texture_decodes_to_rgba8() {
        let path = std::env::temp_dir().join(format!("frame-renderer-{}.png", std::process::id()));
        image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let texture = TextureData::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(texture.extent, vk::Extent2D { width: 3, height: 2 });
        assert_eq!(texture.pixels.len(), 3 * 2 * 4);
        assert_eq!(&texture.pixels[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn uniform_block_is_view_and_projection() {
        assert_eq!(size_of::<UniformBufferObject>(), 2 * 64);
        assert_eq!(size_of::<DrawConstants>(), 64);
    }

    #[test]
    fn projection_is_flipped_for_vulkan() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let scene = SceneData::default();
        assert!(scene.uniforms(extent).proj.y_axis.y < 0.0);
        assert_eq!(scene.draw_constants().model, Mat4::IDENTITY);
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let ubo = SceneData::default().uniforms(vk::Extent2D { width: 800, height: 0 });
        assert!(ubo.proj.is_finite());
    }

    #[test]
    fn checkerboard_alternates() {
        let texture = TextureData::checkerboard(4, 2);
        assert_eq!(texture.pixels.len(), 4 * 4 * 4);
        // (0,0) light, (2,0) dark, (2,2) light.
        assert_eq!(texture.pixels[0], 230);
        assert_eq!(texture.pixels[2 * 4], 40);
        assert_eq!(texture.pixels[(2 * 4 + 2) * 4], 230);
    }
}
