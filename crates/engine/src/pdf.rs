//! PDF renderer.
//!
//! Draws every captured value inside its field rectangle, wrapping the
//! page's existing content in `q`/`Q` so the overlay sees the default
//! coordinate space, then appends a signature certificate page listing each
//! signer. Page resources inherited from the page tree are copied onto the
//! page before the overlay's font and images are added.

use std::collections::BTreeMap;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use quire_core::{FieldType, Position, Signer, SignerRole};
use time::format_description::well_known::Rfc3339;

use crate::error::SealError;
use crate::sealer::{DocumentRenderer, Placement};
use crate::values::{decode_image, parse_date};

/// Resource name of the overlay font.
const FONT: &str = "QuireHelv";
/// Resource name prefix of embedded field images.
const IMAGE_PREFIX: &str = "QuireImg";
/// A4 in points.
const CERTIFICATE_SIZE: (f32, f32) = (595.0, 842.0);
/// Guards against cyclic `Parent` chains.
const MAX_TREE_DEPTH: usize = 64;

/// Seals PDF sources. The default renderer of the orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfRenderer;

impl DocumentRenderer for PdfRenderer {
    fn render(
        &self,
        source: &[u8],
        placements: &[Placement<'_>],
        signers: &[Signer],
    ) -> Result<Vec<u8>, SealError> {
        let mut doc = Document::load_mem(source).map_err(document_error)?;
        let pages = doc.get_pages();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });

        let mut by_page: BTreeMap<u32, Vec<&Placement<'_>>> = BTreeMap::new();
        for placement in placements {
            by_page.entry(placement.page).or_default().push(placement);
        }

        for (page, group) in by_page {
            let Some(&page_id) = pages.get(&page) else {
                return Err(render_error(
                    group[0],
                    &format!("document has no page {} ({} pages)", page, pages.len()),
                ));
            };
            let mut operations = Vec::new();
            let mut images = Vec::new();
            for placement in group {
                match placement.field_type {
                    FieldType::Signature | FieldType::Initials => {
                        let name = format!("{}{}", IMAGE_PREFIX, images.len());
                        let (image_id, width, height) = embed_image(&mut doc, placement)?;
                        operations.extend(draw_image(&name, placement.position, width, height));
                        images.push((name, image_id));
                    }
                    FieldType::Date => {
                        let date = parse_date(placement.value)
                            .ok_or_else(|| render_error(placement, "not a date"))?;
                        operations.extend(draw_text(&date.to_string(), placement.position));
                    }
                    FieldType::Text => {
                        operations.extend(draw_text(placement.value, placement.position));
                    }
                }
            }
            overlay(&mut doc, page_id, font_id, &images, operations).map_err(document_error)?;
        }

        append_certificate(&mut doc, font_id, signers).map_err(document_error)?;

        let mut out = Vec::with_capacity(source.len());
        doc.save_to(&mut out).map_err(|err| document_error(err.into()))?;
        Ok(out)
    }
}

fn document_error(err: lopdf::Error) -> SealError {
    SealError::Document {
        reason: err.to_string(),
    }
}

fn render_error(placement: &Placement<'_>, reason: &str) -> SealError {
    SealError::Render {
        field_id: placement.field_id.to_string(),
        reason: reason.to_string(),
    }
}

fn real(value: f64) -> Object {
    Object::Real(value as f32)
}

/// Decode the data URL and add it as an RGB image with a soft mask for its
/// alpha channel. Returns the image object and its pixel size.
fn embed_image(
    doc: &mut Document,
    placement: &Placement<'_>,
) -> Result<(ObjectId, u32, u32), SealError> {
    let bytes =
        decode_image(placement.value).ok_or_else(|| render_error(placement, "not a base64 image"))?;
    let pixels = image::load_from_memory(&bytes)
        .map_err(|e| render_error(placement, &e.to_string()))?
        .to_rgba8();
    let (width, height) = pixels.dimensions();

    let mut rgb = Vec::with_capacity(pixels.len() / 4 * 3);
    let mut alpha = Vec::with_capacity(pixels.len() / 4);
    for pixel in pixels.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel.0[3]);
    }

    let image_dict = |color_space: &str| {
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(width),
            "Height" => i64::from(height),
            "ColorSpace" => color_space,
            "BitsPerComponent" => 8,
        }
    };

    let mut mask = Stream::new(image_dict("DeviceGray"), alpha);
    mask.compress().map_err(document_error)?;
    let mask_id = doc.add_object(mask);

    let mut dict = image_dict("DeviceRGB");
    dict.set("SMask", mask_id);
    let mut stream = Stream::new(dict, rgb);
    stream.compress().map_err(document_error)?;
    Ok((doc.add_object(stream), width, height))
}

/// Scale the image into the rectangle keeping its aspect ratio, left
/// aligned and vertically centred.
fn draw_image(name: &str, at: Position, width: u32, height: u32) -> Vec<Operation> {
    let scale = (at.width / f64::from(width)).min(at.height / f64::from(height));
    let w = f64::from(width) * scale;
    let h = f64::from(height) * scale;
    let y = at.y + (at.height - h) / 2.0;
    vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![real(w), real(0.0), real(0.0), real(h), real(at.x), real(y)],
        ),
        Operation::new("Do", vec![Object::Name(name.as_bytes().to_vec())]),
        Operation::new("Q", vec![]),
    ]
}

fn font_size(at: Position) -> f64 {
    (at.height * 0.6).clamp(6.0, 14.0)
}

fn draw_text(text: &str, at: Position) -> Vec<Operation> {
    let size = font_size(at);
    let baseline = at.y + (at.height - size) / 2.0 + size * 0.2;
    text_line(text, size, at.x + 2.0, baseline)
}

fn text_line(text: &str, size: f64, x: f64, y: f64) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![Object::Name(FONT.as_bytes().to_vec()), real(size)]),
        Operation::new("Td", vec![real(x), real(y)]),
        Operation::new("Tj", vec![Object::string_literal(win_ansi(text))]),
        Operation::new("ET", vec![]),
    ]
}

/// The standard fonts cover Latin-1; anything else prints as `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match u32::from(c) {
            0x20..=0x7e | 0xa0..=0xff => u32::from(c) as u8,
            _ => b'?',
        })
        .collect()
}

fn resolve_dict(doc: &Document, object: &Object) -> Result<Dictionary, lopdf::Error> {
    match object {
        Object::Reference(id) => Ok(doc.get_dictionary(*id)?.clone()),
        other => Ok(other.as_dict()?.clone()),
    }
}

/// The resources in effect for a page, following `Parent` links.
fn effective_resources(doc: &Document, page_id: ObjectId) -> Result<Dictionary, lopdf::Error> {
    let mut node = doc.get_dictionary(page_id)?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(resources) = node.get(b"Resources") {
            return resolve_dict(doc, resources);
        }
        match node.get(b"Parent").and_then(Object::as_reference) {
            Ok(parent) => node = doc.get_dictionary(parent)?,
            Err(_) => break,
        }
    }
    Ok(Dictionary::new())
}

fn add_resource(
    doc: &Document,
    resources: &mut Dictionary,
    category: &str,
    name: &str,
    value: ObjectId,
) -> Result<(), lopdf::Error> {
    let mut entries = match resources.get(category.as_bytes()) {
        Ok(existing) => resolve_dict(doc, existing)?,
        Err(_) => Dictionary::new(),
    };
    entries.set(name, value);
    resources.set(category, entries);
    Ok(())
}

fn overlay(
    doc: &mut Document,
    page_id: ObjectId,
    font_id: ObjectId,
    images: &[(String, ObjectId)],
    operations: Vec<Operation>,
) -> Result<(), lopdf::Error> {
    let mut resources = effective_resources(doc, page_id)?;
    add_resource(doc, &mut resources, "Font", FONT, font_id)?;
    for (name, id) in images {
        add_resource(doc, &mut resources, "XObject", name, *id)?;
    }

    let mut contents = match doc.get_dictionary(page_id)?.get(b"Contents") {
        Ok(Object::Array(items)) => items.clone(),
        Ok(Object::Reference(id)) => match doc.get_object(*id)? {
            Object::Array(items) => items.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Ok(other) => vec![other.clone()],
        Err(_) => Vec::new(),
    };

    let mut drawn = b"\nQ\n".to_vec();
    drawn.extend(Content { operations }.encode()?);
    let open = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let close = doc.add_object(Stream::new(Dictionary::new(), drawn));
    contents.insert(0, open.into());
    contents.push(close.into());

    let page = doc.get_dictionary_mut(page_id)?;
    page.set("Contents", contents);
    page.set("Resources", resources);
    Ok(())
}

fn role_label(role: SignerRole) -> &'static str {
    match role {
        SignerRole::Sender => "sender",
        SignerRole::Signer => "signer",
    }
}

/// One block per signer in signing order: name and address, role, signing
/// time and the client it was captured from.
fn append_certificate(
    doc: &mut Document,
    font_id: ObjectId,
    signers: &[Signer],
) -> Result<(), lopdf::Error> {
    let (width, height) = CERTIFICATE_SIZE;
    let left = 56.0;
    let mut y = f64::from(height) - 72.0;
    let mut operations = text_line("Signature certificate", 16.0, left, y);
    y -= 32.0;

    let mut ordered: Vec<&Signer> = signers.iter().collect();
    ordered.sort_by_key(|s| s.order);
    for signer in ordered {
        let signed_at = match signer.signed_at {
            Some(at) => at.format(&Rfc3339).unwrap_or_default(),
            None => "-".to_string(),
        };
        let client = signer.client.clone().unwrap_or_default();
        let lines = [
            (11.0, format!("{}. {} <{}>", signer.order, signer.name, signer.email)),
            (9.0, format!("Role: {}", role_label(signer.role))),
            (9.0, format!("Signed: {}", signed_at)),
            (
                9.0,
                format!(
                    "IP: {}  Agent: {}",
                    client.ip.as_deref().unwrap_or("-"),
                    client.user_agent.as_deref().unwrap_or("-")
                ),
            ),
        ];
        for (size, line) in lines {
            operations.extend(text_line(&line, size, left, y));
            y -= size + 5.0;
        }
        y -= 12.0;
    }

    let content_id = doc.add_object(Stream::new(Dictionary::new(), Content { operations }.encode()?));
    let root = doc.trailer.get(b"Root")?.as_reference()?;
    let pages_id = doc.get_dictionary(root)?.get(b"Pages")?.as_reference()?;
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![real(0.0), real(0.0), real(f64::from(width)), real(f64::from(height))],
        "Contents" => content_id,
        "Resources" => dictionary! { "Font" => dictionary! { FONT => font_id } },
    });

    let pages = doc.get_dictionary_mut(pages_id)?;
    let mut kids = match pages.get(b"Kids") {
        Ok(Object::Array(kids)) => kids.clone(),
        _ => Vec::new(),
    };
    kids.push(page_id.into());
    let count = pages.get(b"Count").and_then(Object::as_i64).unwrap_or(0);
    pages.set("Kids", kids);
    pages.set("Count", count + 1);
    Ok(())
}
