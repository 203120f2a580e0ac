//! Wire protocol emitter.
//!
//! Everything the compiler and the scene exporter produce goes through the
//! [`Emitter`] trait as a [`Statement`]. The emitter writes statements in the
//! order it receives them and never checks cross references: declaration order
//! is the compiler's job.
//!
//! [`RibWriter`] renders statements as renderer-readable text into any
//! `io::Write` (a scene file or the renderer's standard input).
//! [`Recorder`] keeps them in memory.

use std::io::{self, Write};

use crate::codec::WireValue;

/// Reserved parameter key carrying a light's unique handle.
pub const HANDLE_ID: &str = "__handleid";

/// Ordered `"type name" -> value` pairs. Order is emission order.
pub type ParamList = Vec<(String, WireValue)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Pattern,
    Bxdf,
    Displacement,
    AreaLightSource,
    Attribute,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Pattern => "Pattern",
            Verb::Bxdf => "Bxdf",
            Verb::Displacement => "Displacement",
            Verb::AreaLightSource => "AreaLightSource",
            Verb::Attribute => "Attribute",
        }
    }
}

/// One record per emitted node (plus side records such as a light's visibility block).
#[derive(Debug, Clone, PartialEq)]
pub struct DeclarationRecord {
    pub verb: Verb,
    /// Shader type name, or the attribute name for [`Verb::Attribute`].
    pub name: String,
    pub handle: Option<String>,
    pub params: ParamList,
}

impl DeclarationRecord {
    pub fn param(&self, key: &str) -> Option<&WireValue> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Frame(u32),
    World,
    Attribute,
    EditWorld(String),
    Edit { kind: String, scope: String },
}

/// Positional argument of a generic call.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strs(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Declare(DeclarationRecord),
    ArchiveRecord { format: String, text: String },
    Begin(Block),
    End(Block),
    Call {
        verb: String,
        args: Vec<Arg>,
        params: ParamList,
    },
}

pub trait Emitter {
    fn emit(&mut self, statement: Statement) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn declare(&mut self, record: DeclarationRecord) -> io::Result<()> {
        self.emit(Statement::Declare(record))
    }

    fn archive_record(&mut self, format: &str, text: &str) -> io::Result<()> {
        self.emit(Statement::ArchiveRecord {
            format: format.to_string(),
            text: text.to_string(),
        })
    }

    fn begin(&mut self, block: Block) -> io::Result<()> {
        self.emit(Statement::Begin(block))
    }

    fn end(&mut self, block: Block) -> io::Result<()> {
        self.emit(Statement::End(block))
    }

    fn call(&mut self, verb: &str, args: Vec<Arg>, params: ParamList) -> io::Result<()> {
        self.emit(Statement::Call {
            verb: verb.to_string(),
            args,
            params,
        })
    }
}

impl<E: Emitter + ?Sized> Emitter for &mut E {
    fn emit(&mut self, statement: Statement) -> io::Result<()> {
        (**self).emit(statement)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// In-memory emitter, used by tests and by edit planning.
#[derive(Debug, Default, Clone)]
pub struct Recorder {
    pub statements: Vec<Statement>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declarations(&self) -> impl Iterator<Item = &DeclarationRecord> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Declare(r) => Some(r),
            _ => None,
        })
    }
}

impl Emitter for Recorder {
    fn emit(&mut self, statement: Statement) -> io::Result<()> {
        self.statements.push(statement);
        Ok(())
    }
}

/// Writes statements as scene-description text.
pub struct RibWriter<W: Write> {
    out: W,
    depth: usize,
}

impl<W: Write> RibWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, depth: 0 }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) -> io::Result<()> {
        for _ in 0..self.depth {
            self.out.write_all(b"    ")?;
        }
        self.out.write_all(text.as_bytes())?;
        self.out.write_all(b"\n")
    }
}

impl<W: Write> Emitter for RibWriter<W> {
    fn emit(&mut self, statement: Statement) -> io::Result<()> {
        if !is_finite(&statement) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non-finite number in {statement:?}"),
            ));
        }
        match statement {
            Statement::Declare(record) => {
                let line = format_declaration(&record);
                self.line(&line)
            }
            Statement::ArchiveRecord { format, text } => {
                let line = match format.as_str() {
                    "structure" => format!("##{text}"),
                    _ => format!("# {text}"),
                };
                self.line(&line)
            }
            Statement::Begin(block) => {
                let line = match &block {
                    Block::Frame(n) => format!("FrameBegin {n}"),
                    Block::World => "WorldBegin".to_string(),
                    Block::Attribute => "AttributeBegin".to_string(),
                    Block::EditWorld(name) => format!("EditWorldBegin {}", quote(name)),
                    Block::Edit { kind, scope } => format!(
                        "EditBegin {} \"string scopename\" [{}]",
                        quote(kind),
                        quote(scope)
                    ),
                };
                self.line(&line)?;
                self.depth += 1;
                Ok(())
            }
            Statement::End(block) => {
                self.depth = self.depth.saturating_sub(1);
                let line = match block {
                    Block::Frame(_) => "FrameEnd",
                    Block::World => "WorldEnd",
                    Block::Attribute => "AttributeEnd",
                    Block::EditWorld(_) => "EditWorldEnd",
                    Block::Edit { .. } => "EditEnd",
                };
                self.line(line)
            }
            Statement::Call { verb, args, params } => {
                let mut line = verb;
                for arg in &args {
                    line.push(' ');
                    line.push_str(&format_arg(arg));
                }
                push_params(&mut line, &params);
                self.line(&line)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

fn is_finite(statement: &Statement) -> bool {
    let params_ok = |params: &ParamList| {
        params.iter().all(|(_, v)| match v {
            WireValue::Floats(f) => f.iter().all(|x| x.is_finite()),
            _ => true,
        })
    };
    match statement {
        Statement::Declare(record) => params_ok(&record.params),
        Statement::Call { args, params, .. } => {
            params_ok(params)
                && args.iter().all(|a| match a {
                    Arg::Float(f) => f.is_finite(),
                    Arg::Floats(v) => v.iter().all(|x| x.is_finite()),
                    _ => true,
                })
        }
        _ => true,
    }
}

fn format_declaration(record: &DeclarationRecord) -> String {
    let mut line = format!("{} {}", record.verb.as_str(), quote(&record.name));
    match record.verb {
        // The handle travels in the reserved parameter and is written positionally.
        Verb::AreaLightSource => {
            let handle = match record.param(HANDLE_ID) {
                Some(WireValue::Strings(v)) if !v.is_empty() => Some(v[0].as_str()),
                _ => record.handle.as_deref(),
            };
            if let Some(h) = handle {
                line.push(' ');
                line.push_str(&quote(h));
            }
            let rest: ParamList = record
                .params
                .iter()
                .filter(|(k, _)| k != HANDLE_ID)
                .cloned()
                .collect();
            push_params(&mut line, &rest);
        }
        _ => {
            if let Some(h) = &record.handle {
                line.push(' ');
                line.push_str(&quote(h));
            }
            push_params(&mut line, &record.params);
        }
    }
    line
}

fn push_params(line: &mut String, params: &ParamList) {
    for (key, value) in params {
        line.push(' ');
        line.push_str(&quote(key));
        line.push(' ');
        line.push_str(&format_value(value));
    }
}

fn format_value(value: &WireValue) -> String {
    let items: Vec<String> = match value {
        WireValue::Ints(v) => v.iter().map(|i| i.to_string()).collect(),
        WireValue::Floats(v) => v.iter().map(|f| format_float(*f)).collect(),
        WireValue::Strings(v) => v.iter().map(|s| quote(s)).collect(),
    };
    format!("[{}]", items.join(" "))
}

fn format_arg(arg: &Arg) -> String {
    match arg {
        Arg::Str(s) => quote(s),
        Arg::Int(i) => i.to_string(),
        Arg::Float(f) => format_float(*f),
        Arg::Ints(v) => format_value(&WireValue::Ints(v.clone())),
        Arg::Floats(v) => format_value(&WireValue::Floats(v.clone())),
        Arg::Strs(v) => format_value(&WireValue::Strings(v.clone())),
    }
}

fn format_float(f: f64) -> String {
    format!("{f}")
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(statements: Vec<Statement>) -> String {
        let mut w = RibWriter::new(Vec::new());
        for s in statements {
            w.emit(s).unwrap();
        }
        String::from_utf8(w.into_inner()).unwrap()
    }

    #[test]
    fn declarations_keep_key_convention() {
        let text = render(vec![Statement::Declare(DeclarationRecord {
            verb: Verb::Pattern,
            name: "PxrTexture".into(),
            handle: Some("mat_tex".into()),
            params: vec![
                ("string filename".into(), WireValue::string("wood.tex")),
                ("float[2] positions".into(), WireValue::Floats(vec![0.0, 0.5])),
                ("int linearize".into(), WireValue::Ints(vec![1])),
            ],
        })]);
        assert_eq!(
            text,
            "Pattern \"PxrTexture\" \"mat_tex\" \"string filename\" [\"wood.tex\"] \"float[2] positions\" [0 0.5] \"int linearize\" [1]\n"
        );
    }

    #[test]
    fn area_light_handle_is_positional() {
        let text = render(vec![Statement::Declare(DeclarationRecord {
            verb: Verb::AreaLightSource,
            name: "PxrStdAreaLight".into(),
            handle: Some("key".into()),
            params: vec![
                ("float intensity".into(), WireValue::Floats(vec![2.0])),
                (HANDLE_ID.into(), WireValue::string("key")),
            ],
        })]);
        assert_eq!(
            text,
            "AreaLightSource \"PxrStdAreaLight\" \"key\" \"float intensity\" [2]\n"
        );
    }

    #[test]
    fn blocks_indent_and_edits_carry_scope() {
        let text = render(vec![
            Statement::Begin(Block::EditWorld("session".into())),
            Statement::Begin(Block::Edit {
                kind: "attribute".into(),
                scope: "cube".into(),
            }),
            Statement::ArchiveRecord {
                format: "comment".into(),
                text: "Shader Graph".into(),
            },
            Statement::End(Block::Edit {
                kind: "attribute".into(),
                scope: "cube".into(),
            }),
            Statement::End(Block::EditWorld("session".into())),
        ]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "EditWorldBegin \"session\"",
                "    EditBegin \"attribute\" \"string scopename\" [\"cube\"]",
                "        # Shader Graph",
                "    EditEnd",
                "EditWorldEnd",
            ]
        );
    }

    #[test]
    fn non_finite_numbers_are_refused() {
        let mut w = RibWriter::new(Vec::new());
        let err = w
            .call("PixelVariance", vec![Arg::Float(f64::NAN)], Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = w
            .declare(DeclarationRecord {
                verb: Verb::Pattern,
                name: "PxrMix".into(),
                handle: Some("m".into()),
                params: vec![("float mix".into(), WireValue::Floats(vec![f64::INFINITY]))],
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(w.into_inner().is_empty());
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(quote("a \"b\" \\c"), "\"a \\\"b\\\" \\\\c\"");
    }

    #[test]
    fn recorder_keeps_order() {
        let mut rec = Recorder::new();
        rec.archive_record("comment", "x").unwrap();
        rec.call("Format", vec![Arg::Int(640), Arg::Int(480), Arg::Float(1.0)], Vec::new())
            .unwrap();
        assert_eq!(rec.statements.len(), 2);
        assert_eq!(rec.declarations().count(), 0);
    }
}
