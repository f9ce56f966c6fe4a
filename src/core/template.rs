//! ST-003: `{{ .field }}` template expansion.
//!
//! A template is expanded against a reference (any [`Fields`]) repeatedly
//! until it stops changing, bounded by a configurable number of rounds. A
//! template that still contains placeholders after the last round is a
//! rendering loop.
//!
//! A quoted string is emitted as-is and never expanded again, so
//! `{{"{{"}}.Names}}` renders to `{{.Names}}`.

use super::error::RenderError;
use super::schema::Fields;

/// Default bound on expansion rounds.
pub const DEFAULT_RENDER_ROUNDS: usize = 8;

/// Expands templates against one reference.
pub struct Renderer<'a> {
    reference: &'a dyn Fields,
    rounds: usize,
}

impl<'a> Renderer<'a> {
    pub fn new(reference: &'a dyn Fields, rounds: usize) -> Self {
        Self { reference, rounds }
    }

    pub fn reference(&self) -> &'a dyn Fields {
        self.reference
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Expand `template` to a fixed point.
    pub fn render(&self, template: &str) -> Result<String, RenderError> {
        let mut pieces = vec![Piece::Text(template.to_string())];
        for _ in 0..self.rounds {
            if !pieces.iter().any(Piece::pending) {
                return Ok(join(pieces));
            }
            let mut next = Vec::with_capacity(pieces.len());
            for piece in pieces {
                match piece {
                    Piece::Text(text) if text.contains("{{") => {
                        self.substitute(template, &text, &mut next)?;
                    }
                    done => next.push(done),
                }
            }
            pieces = next;
        }
        if pieces.iter().any(Piece::pending) {
            return Err(RenderError::Loop {
                template: template.to_string(),
                rounds: self.rounds,
            });
        }
        Ok(join(pieces))
    }

    /// One expansion round over `text`. Substituted values become their own
    /// pieces and are not rescanned in this round.
    fn substitute(
        &self,
        template: &str,
        text: &str,
        out: &mut Vec<Piece>,
    ) -> Result<(), RenderError> {
        let mut rest = text;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            let close = rest[open..]
                .find("}}")
                .map(|c| open + c + 2)
                .ok_or_else(|| RenderError::Unclosed {
                    template: template.to_string(),
                    position: offset + open,
                })?;
            if open > 0 {
                out.push(Piece::Text(rest[..open].to_string()));
            }
            let expr = rest[open + 2..close - 2].trim();
            match parse_expr(expr)? {
                Expr::Literal(text) => out.push(Piece::Literal(text.to_string())),
                Expr::Field(field) => {
                    let value = self
                        .reference
                        .field(field)
                        .ok_or_else(|| RenderError::UnknownField {
                            field: field.to_string(),
                        })?
                        .render();
                    out.push(Piece::Text(value));
                }
            }
            offset += close;
            rest = &rest[close..];
        }
        if !rest.is_empty() {
            out.push(Piece::Text(rest.to_string()));
        }
        Ok(())
    }
}

/// Rendering state: text still to expand, or escaped text that is final.
enum Piece {
    Text(String),
    Literal(String),
}

impl Piece {
    fn pending(&self) -> bool {
        matches!(self, Self::Text(text) if text.contains("{{"))
    }
}

fn join(pieces: Vec<Piece>) -> String {
    pieces
        .into_iter()
        .map(|piece| match piece {
            Piece::Text(text) | Piece::Literal(text) => text,
        })
        .collect()
}

enum Expr<'e> {
    Field(&'e str),
    Literal(&'e str),
}

fn parse_expr(expr: &str) -> Result<Expr<'_>, RenderError> {
    if let Some(text) = expr
        .strip_prefix('"')
        .and_then(|e| e.strip_suffix('"'))
        .filter(|t| !t.contains('"'))
    {
        return Ok(Expr::Literal(text));
    }
    parse_field(expr).map(Expr::Field)
}

fn parse_field(expr: &str) -> Result<&str, RenderError> {
    let invalid = || RenderError::Expression {
        expr: expr.to_string(),
    };
    let name = expr.strip_prefix('.').ok_or_else(invalid)?;
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid());
    }
    Ok(name)
}
