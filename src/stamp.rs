//! Signature stamping.
//!
//! Places the signature image in the bottom-right corner of every page of a PDF.
//! Geometry is computed in page-view space (the page as displayed after `/Rotate`,
//! origin top-left, y grows downward) and converted to PDF user space only when
//! the drawing operators are emitted.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_WIDTH: f64 = 120.0;
pub const DEFAULT_HEIGHT: f64 = 60.0;
pub const DEFAULT_MARGIN: f64 = 20.0;

/// Smallest usable extent per axis, whatever the margin.
const MIN_USABLE: f64 = 10.0;
const XOBJECT_NAME: &str = "SigdeskStamp";
const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum StampError {
    #[error("signature image not found: {path}")]
    SignatureMissing { path: String },
    #[error("failed to place signature on page {page}: {reason}")]
    Compositing { page: u32, reason: String },
    #[error("invalid source document: {0}")]
    Document(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampOptions {
    pub width: f64,
    pub height: f64,
    pub margin: f64,
}

impl Default for StampOptions {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            margin: DEFAULT_MARGIN,
        }
    }
}

impl StampOptions {
    /// Builds options from textual input. Unparseable values fall back to the
    /// defaults with a warning; the size falls back as a pair.
    pub fn coerce(width: &str, height: &str, margin: &str) -> Self {
        let (width_value, height_value) = match (parse_number(width), parse_number(height)) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                warn!(
                    width = %width,
                    height = %height,
                    "invalid stamp size, falling back to {DEFAULT_WIDTH}x{DEFAULT_HEIGHT}"
                );
                (DEFAULT_WIDTH, DEFAULT_HEIGHT)
            }
        };

        let margin_value = parse_number(margin).unwrap_or_else(|| {
            warn!(margin = %margin, "invalid stamp margin, falling back to {DEFAULT_MARGIN}");
            DEFAULT_MARGIN
        });

        Self {
            width: width_value,
            height: height_value,
            margin: margin_value,
        }
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

/// Computes the stamp rectangle for a page of `page_width` x `page_height`.
///
/// The rectangle's bottom-right corner sits at `(page_width - margin,
/// page_height - margin)` and every coordinate is clamped into the page.
pub fn placement_rect(page_width: f64, page_height: f64, options: &StampOptions) -> Rect {
    let margin = options.margin;
    let usable_w = (page_width - 2.0 * margin).max(MIN_USABLE);
    let usable_h = (page_height - 2.0 * margin).max(MIN_USABLE);

    let mut rect_w = options.width.min(usable_w);
    let mut rect_h = options.height.min(usable_h);

    if rect_w <= 0.0 || rect_h <= 0.0 {
        rect_w = DEFAULT_WIDTH.min(usable_w);
        rect_h = DEFAULT_HEIGHT.min(usable_h);
    }

    let x1 = page_width - margin;
    let y1 = page_height - margin;
    let x0 = x1 - rect_w;
    let y0 = y1 - rect_h;

    Rect::new(
        clamp_into(x0, page_width),
        clamp_into(y0, page_height),
        clamp_into(x1, page_width),
        clamp_into(y1, page_height),
    )
}

fn clamp_into(value: f64, upper: f64) -> f64 {
    value.min(upper).max(0.0)
}

/// Scales an image of `image_width` x `image_height` uniformly into `rect` and
/// centers it. The aspect ratio is kept; the unused space is left empty.
pub fn fit_image(rect: Rect, image_width: u32, image_height: u32) -> Rect {
    if image_width == 0 || image_height == 0 || rect.width() <= 0.0 || rect.height() <= 0.0 {
        return rect;
    }

    let scale = (rect.width() / f64::from(image_width)).min(rect.height() / f64::from(image_height));
    let width = f64::from(image_width) * scale;
    let height = f64::from(image_height) * scale;
    let x0 = rect.x0 + (rect.width() - width) / 2.0;
    let y0 = rect.y0 + (rect.height() - height) / 2.0;

    Rect::new(x0, y0, x0 + width, y0 + height)
}

#[derive(Debug, Clone, Copy)]
struct EmbeddedImage {
    id: ObjectId,
    width: u32,
    height: u32,
}

/// Stamps `signature` onto every page of `source` and returns the new document.
///
/// A failure on any page aborts the whole operation; no partially stamped
/// document is ever returned.
pub fn stamp_pdf(
    source: &[u8],
    signature: &[u8],
    options: &StampOptions,
) -> Result<Vec<u8>, StampError> {
    let mut doc =
        Document::load_mem(source).map_err(|err| StampError::Document(err.to_string()))?;

    let pages: Vec<(u32, ObjectId)> = doc.get_pages().into_iter().collect();
    let mut embedded: Option<EmbeddedImage> = None;

    for (page_number, page_id) in pages {
        stamp_page(&mut doc, page_id, signature, &mut embedded, options).map_err(|reason| {
            warn!(page = page_number, reason = %reason, "failed inserting signature");
            StampError::Compositing {
                page: page_number,
                reason,
            }
        })?;
    }

    let mut output = Vec::new();
    doc.save_to(&mut output)
        .map_err(|err| StampError::Document(format!("failed to write stamped document: {err}")))?;
    Ok(output)
}

fn stamp_page(
    doc: &mut Document,
    page_id: ObjectId,
    signature: &[u8],
    embedded: &mut Option<EmbeddedImage>,
    options: &StampOptions,
) -> Result<(), String> {
    let image = match *embedded {
        Some(image) => image,
        None => {
            let image = embed_signature(doc, signature)?;
            *embedded = Some(image);
            image
        }
    };

    let bounds = page_box(doc, page_id)?;
    let rotation = page_rotation(doc, page_id)?;
    let [llx, lly, urx, ury] = bounds;
    let (page_width, page_height) = match rotation {
        90 | 270 => (ury - lly, urx - llx),
        _ => (urx - llx, ury - lly),
    };

    let rect = placement_rect(page_width, page_height, options);
    let placed = fit_image(rect, image.width, image.height);
    debug!(
        page_width,
        page_height,
        rotation,
        x0 = rect.x0,
        y0 = rect.y0,
        x1 = rect.x1,
        y1 = rect.y1,
        "computed stamp placement"
    );

    let matrix = placement_matrix(bounds, rotation, placed);
    let name = attach_xobject(doc, page_id, image.id)?;
    append_drawing(doc, page_id, &name, matrix)
}

/// Maps the unit image square onto `placed`, given in page-view space (origin at
/// the top-left corner of the page as displayed, y growing downwards).
///
/// The image stays upright for the viewer whatever the page's `/Rotate`.
fn placement_matrix(page_box: [f64; 4], rotation: i64, placed: Rect) -> [f64; 6] {
    let [llx, lly, urx, ury] = page_box;
    // view -> user: x = ox + p*vx + q*vy, y = oy + r*vx + s*vy
    let (ox, oy, p, q, r, s) = match rotation {
        90 => (llx, lly, 0.0, 1.0, 1.0, 0.0),
        180 => (urx, lly, -1.0, 0.0, 0.0, 1.0),
        270 => (urx, ury, 0.0, -1.0, -1.0, 0.0),
        _ => (llx, ury, 1.0, 0.0, 0.0, -1.0),
    };
    let (w, h) = (placed.width(), placed.height());
    // image (u, v) sits at view (x0 + u*w, y1 - v*h)
    [
        p * w,
        r * w,
        -q * h,
        -s * h,
        ox + p * placed.x0 + q * placed.y1,
        oy + r * placed.x0 + s * placed.y1,
    ]
}

fn embed_signature(doc: &mut Document, signature: &[u8]) -> Result<EmbeddedImage, String> {
    let decoded = image::load_from_memory(signature)
        .map_err(|err| format!("unreadable signature image: {err}"))?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return Err("signature image has no pixels".to_string());
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    for pixel in rgba.pixels() {
        let [r, g, b, a] = pixel.0;
        rgb.extend_from_slice(&[r, g, b]);
        alpha.push(a);
    }

    let smask_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(width),
            "Height" => i64::from(height),
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8_i64,
            "Filter" => "FlateDecode",
        },
        deflate(&alpha)?,
    ));

    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(width),
            "Height" => i64::from(height),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8_i64,
            "Filter" => "FlateDecode",
            "SMask" => Object::Reference(smask_id),
        },
        deflate(&rgb)?,
    ));

    Ok(EmbeddedImage {
        id: image_id,
        width,
        height,
    })
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|err| format!("failed to compress image data: {err}"))?;
    encoder
        .finish()
        .map_err(|err| format!("failed to compress image data: {err}"))
}

/// Returns the visible page box as `[llx, lly, urx, ury]`, preferring CropBox.
fn page_box(doc: &Document, page_id: ObjectId) -> Result<[f64; 4], String> {
    for key in [b"CropBox".as_slice(), b"MediaBox".as_slice()] {
        if let Some(value) = inherited_attribute(doc, page_id, key)? {
            return parse_box(doc, value);
        }
    }
    Err("page has no MediaBox".to_string())
}

fn parse_box(doc: &Document, value: &Object) -> Result<[f64; 4], String> {
    let items = resolve(doc, value)?
        .as_array()
        .map_err(|_| "page box is not an array".to_string())?;
    if items.len() != 4 {
        return Err(format!("page box has {} entries", items.len()));
    }

    let mut numbers = [0.0_f64; 4];
    for (slot, item) in numbers.iter_mut().zip(items) {
        *slot = resolve(doc, item)
            .ok()
            .and_then(as_number)
            .ok_or_else(|| "page box entry is not a number".to_string())?;
    }

    let [ax, ay, bx, by] = numbers;
    Ok([ax.min(bx), ay.min(by), ax.max(bx), ay.max(by)])
}

fn as_number(value: &Object) -> Option<f64> {
    match value {
        Object::Integer(number) => Some(*number as f64),
        Object::Real(number) => Some(f64::from(*number)),
        _ => None,
    }
}

fn resolve<'a>(doc: &'a Document, value: &'a Object) -> Result<&'a Object, String> {
    match value {
        Object::Reference(id) => doc
            .get_object(*id)
            .map_err(|err| format!("reference {id:?} not found: {err}")),
        other => Ok(other),
    }
}

fn resolve_dict(doc: &Document, value: &Object) -> Result<Dictionary, String> {
    match resolve(doc, value)? {
        Object::Dictionary(dict) => Ok(dict.clone()),
        _ => Err("expected a dictionary".to_string()),
    }
}

/// Looks up `key` on the page, walking up the page tree for inheritable entries.
fn inherited_attribute<'a>(
    doc: &'a Document,
    page_id: ObjectId,
    key: &[u8],
) -> Result<Option<&'a Object>, String> {
    let mut current = Some(page_id);
    let mut depth = 0;

    while let Some(node_id) = current {
        if depth > MAX_TREE_DEPTH {
            return Err("page tree is too deep".to_string());
        }
        let node = doc
            .get_dictionary(node_id)
            .map_err(|err| format!("page node {node_id:?} unreadable: {err}"))?;
        if let Ok(value) = node.get(key) {
            return Ok(Some(value));
        }
        current = node.get(b"Parent").and_then(|parent| parent.as_reference()).ok();
        depth += 1;
    }

    Ok(None)
}

/// Registers the image in the page's own resource dictionary and returns the
/// name it was registered under. Inherited or shared resources are copied so
/// other pages are not affected.
fn attach_xobject(doc: &mut Document, page_id: ObjectId, image_id: ObjectId) -> Result<String, String> {
    let mut resources = match inherited_attribute(doc, page_id, b"Resources")? {
        Some(value) => resolve_dict(doc, value)?,
        None => Dictionary::new(),
    };
    let mut xobjects = match resources.get(b"XObject") {
        Ok(value) => resolve_dict(doc, value)?,
        Err(_) => Dictionary::new(),
    };

    let mut name = XOBJECT_NAME.to_string();
    let mut suffix = 0;
    while xobjects.has(name.as_bytes()) {
        suffix += 1;
        name = format!("{XOBJECT_NAME}{suffix}");
    }

    xobjects.set(name.clone(), Object::Reference(image_id));
    resources.set("XObject", Object::Dictionary(xobjects));

    page_dict_mut(doc, page_id)?.set("Resources", Object::Dictionary(resources));
    Ok(name)
}

fn append_drawing(
    doc: &mut Document,
    page_id: ObjectId,
    name: &str,
    matrix: [f64; 6],
) -> Result<(), String> {
    let existing = current_contents(doc, page_id)?;

    let open_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let cm = matrix.map(operand).join(" ");
    let operators = format!("Q\nq\n{cm} cm\n/{name} Do\nQ\n");
    let draw_id = doc.add_object(Stream::new(Dictionary::new(), operators.into_bytes()));

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(open_id));
    contents.extend(existing);
    contents.push(Object::Reference(draw_id));

    page_dict_mut(doc, page_id)?.set("Contents", Object::Array(contents));
    Ok(())
}

fn operand(value: f64) -> String {
    if value == 0.0 {
        "0".to_string()
    } else {
        format!("{value:.4}")
    }
}

/// The page's `/Rotate`, normalized to a clockwise quarter turn in `0..360`.
fn page_rotation(doc: &Document, page_id: ObjectId) -> Result<i64, String> {
    let Some(value) = inherited_attribute(doc, page_id, b"Rotate")? else {
        return Ok(0);
    };
    let degrees = resolve(doc, value)
        .ok()
        .and_then(as_number)
        .ok_or_else(|| "page rotation is not a number".to_string())?;
    let quarter_turns = (degrees / 90.0).round() as i64;
    Ok(quarter_turns.rem_euclid(4) * 90)
}

/// The page's content stream references, with an indirect array flattened.
fn current_contents(doc: &Document, page_id: ObjectId) -> Result<Vec<Object>, String> {
    let page = doc
        .get_dictionary(page_id)
        .map_err(|err| format!("page unreadable: {err}"))?;

    let contents = match page.get(b"Contents") {
        Ok(value) => value,
        Err(_) => return Ok(Vec::new()),
    };

    match contents {
        Object::Array(items) => Ok(items.clone()),
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Array(items)) => Ok(items.clone()),
            Ok(_) => Ok(vec![Object::Reference(*id)]),
            Err(err) => Err(format!("content stream {id:?} not found: {err}")),
        },
        _ => Err("page contents are neither a stream nor an array".to_string()),
    }
}

fn page_dict_mut(doc: &mut Document, page_id: ObjectId) -> Result<&mut Dictionary, String> {
    doc.get_object_mut(page_id)
        .and_then(|object| object.as_dict_mut())
        .map_err(|err| format!("page unreadable: {err}"))
}
