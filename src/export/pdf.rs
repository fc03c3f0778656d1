// src/export/pdf.rs
//! A small PDF 1.4 writer for plain text pages: A4, Courier, WinAnsi
//! encoded. Enough for report tables and receipt letters.

use std::fmt::Write as _;
use std::path::Path;

use crate::errors::Result;
use crate::models::ReportTable;

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 50.0;
const FONT_SIZE: f32 = 9.0;
const LEADING: f32 = 12.0;
/// Courier glyphs are 0.6 em wide.
const CHARS_PER_LINE: usize = ((PAGE_WIDTH - 2.0 * MARGIN) / (FONT_SIZE * 0.6)) as usize;
const LINES_PER_PAGE: usize = ((PAGE_HEIGHT - 2.0 * MARGIN) / LEADING) as usize;
const MAX_COLUMN_WIDTH: usize = 30;

#[derive(Debug, Clone, Default)]
pub struct PdfDocument {
    pages: Vec<Vec<String>>,
}

impl PdfDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new page with `lines`; long text wraps and spills onto
    /// further pages.
    pub fn add_section(&mut self, lines: &[String]) {
        let wrapped: Vec<String> = lines.iter().flat_map(|l| wrap(l)).collect();
        if wrapped.is_empty() {
            self.pages.push(Vec::new());
            return;
        }
        for chunk in wrapped.chunks(LINES_PER_PAGE) {
            self.pages.push(chunk.to_vec());
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len().max(1)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let empty = vec![Vec::new()];
        let pages = if self.pages.is_empty() { &empty } else { &self.pages };

        let mut out: Vec<u8> = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
        let mut offsets: Vec<usize> = Vec::new();

        // 1 catalog, 2 page tree, 3 font, then a page and its content per page
        let page_ids: Vec<usize> = (0..pages.len()).map(|i| 4 + i * 2).collect();
        let kids = page_ids
            .iter()
            .map(|id| format!("{} 0 R", id))
            .collect::<Vec<_>>()
            .join(" ");

        push_object(&mut out, &mut offsets, b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
        push_object(
            &mut out,
            &mut offsets,
            format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids, pages.len()).into_bytes(),
        );
        push_object(
            &mut out,
            &mut offsets,
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Courier /Encoding /WinAnsiEncoding >>".to_vec(),
        );

        for (page, id) in pages.iter().zip(&page_ids) {
            push_object(
                &mut out,
                &mut offsets,
                format!(
                    "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] \
                     /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
                    PAGE_WIDTH,
                    PAGE_HEIGHT,
                    id + 1
                )
                .into_bytes(),
            );

            let content = page_content(page);
            let mut stream = format!("<< /Length {} >>\nstream\n", content.len()).into_bytes();
            stream.extend_from_slice(&content);
            stream.extend_from_slice(b"\nendstream");
            push_object(&mut out, &mut offsets, stream);
        }

        let xref_start = out.len();
        let mut trailer = String::new();
        let _ = writeln!(trailer, "xref\n0 {}", offsets.len() + 1);
        trailer.push_str("0000000000 65535 f \n");
        for offset in &offsets {
            let _ = writeln!(trailer, "{:010} 00000 n ", offset);
        }
        let _ = write!(
            trailer,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            offsets.len() + 1,
            xref_start
        );
        out.extend_from_slice(trailer.as_bytes());
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

fn push_object(out: &mut Vec<u8>, offsets: &mut Vec<usize>, body: Vec<u8>) {
    offsets.push(out.len());
    let id = offsets.len();
    out.extend_from_slice(format!("{} 0 obj\n", id).as_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(b"\nendobj\n");
}

fn page_content(lines: &[String]) -> Vec<u8> {
    let mut content = format!(
        "BT\n/F1 {} Tf\n{} TL\n{} {} Td\n",
        FONT_SIZE,
        LEADING,
        MARGIN,
        PAGE_HEIGHT - MARGIN - FONT_SIZE
    )
    .into_bytes();
    for line in lines {
        content.push(b'(');
        content.extend(encode_text(line));
        content.extend_from_slice(b") Tj T*\n");
    }
    content.extend_from_slice(b"ET");
    content
}

/// WinAnsi bytes of `text` with string delimiters escaped. Characters the
/// encoding lacks become `?`.
fn encode_text(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                bytes.push(b'\\');
                bytes.push(c as u8);
            }
            '\t' => bytes.push(b' '),
            c if (c as u32) >= 0x20 && (c as u32) < 0x7F => bytes.push(c as u8),
            c if (c as u32) >= 0xA0 && (c as u32) <= 0xFF => bytes.push(c as u32 as u8),
            c => bytes.push(win_ansi_extra(c).unwrap_or(b'?')),
        }
    }
    bytes
}

/// The WinAnsi 0x80..=0x9F block, which differs from Latin-1.
fn win_ansi_extra(c: char) -> Option<u8> {
    let byte = match c {
        '€' => 0x80,
        '‚' => 0x82,
        'ƒ' => 0x83,
        '„' => 0x84,
        '…' => 0x85,
        '†' => 0x86,
        '‡' => 0x87,
        'ˆ' => 0x88,
        '‰' => 0x89,
        'Š' => 0x8A,
        '‹' => 0x8B,
        'Œ' => 0x8C,
        'Ž' => 0x8E,
        '‘' => 0x91,
        '’' => 0x92,
        '“' => 0x93,
        '”' => 0x94,
        '•' => 0x95,
        '–' => 0x96,
        '—' => 0x97,
        '˜' => 0x98,
        '™' => 0x99,
        'š' => 0x9A,
        '›' => 0x9B,
        'œ' => 0x9C,
        'ž' => 0x9E,
        'Ÿ' => 0x9F,
        _ => return None,
    };
    Some(byte)
}

fn wrap(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    if chars.len() <= CHARS_PER_LINE {
        return vec![line.to_string()];
    }
    chars
        .chunks(CHARS_PER_LINE)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Lays a report table out as fixed-width text lines.
pub fn table_lines(table: &ReportTable) -> Vec<String> {
    let mut widths: Vec<usize> = table.columns.iter().map(|c| c.chars().count()).collect();
    for row in &table.rows {
        for (col, value) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(col) {
                *width = (*width).max(value.chars().count());
            }
        }
    }
    for width in &mut widths {
        *width = (*width).min(MAX_COLUMN_WIDTH);
    }

    let format_row = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| {
                let cell: String = cell.chars().take(*width).collect();
                format!("{:<width$}", cell, width = *width)
            })
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![table.title.clone(), String::new(), format_row(&table.columns)];
    lines.push("-".repeat(lines[2].chars().count()));
    lines.extend(table.rows.iter().map(|row| format_row(row)));
    lines
}
