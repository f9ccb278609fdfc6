// This module parses the textual form of the portable IR. The format is line oriented:
// `;` starts a comment, header lines declare the stage, shader info, I/O variables and
// legacy variables, and every other line is one instruction or one control-flow marker.
// Instruction lines look like `%name:BITSxCOMPS = op src src ... {key=value flag}`:
// SSA sources are `%name` with an optional `.xyzw` swizzle, variable references are
// `$name`, `$name[3]`, `$name[%i]` or `$name[%i+3]` with an optional `.c` component,
// texture sources are tagged `kind=src`, and the braces hold intrinsic indices or texture
// parameters. Control flow is written `if %c [uniform] {`, `} else {`, `loop [uniform] {`
// and `}`, with `break`, `continue` and `return` as plain lines. Everything is funnelled
// through ShaderBuilder, so the structural checks it does apply here as well.

//! Parser for the textual portable IR.

use crate::ir::{
    AluOp, AluSrc, BaseType, Dest, Instr, Interpolation, Intrinsic, IntrinsicIndices,
    IntrinsicInstr, IoVariable, JumpKind, SamplerDim, Shader, ShaderBuilder, Src, SsaDef, Stage,
    TexInstr, TexOp, TexSrc, TexSrcKind, VarId, VarRef, Variable,
};
use hashbrown::HashMap;
use thiserror::Error;

/// A syntax or semantic error, with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

type PResult<T> = Result<T, String>;

/// Parse a whole shader.
pub fn parse_shader(text: &str) -> Result<Shader, ParseError> {
    let mut parser = Parser::default();
    let mut last = 0;
    for (index, raw) in text.lines().enumerate() {
        last = index + 1;
        let line = raw.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        parser.parse_line(line).map_err(|message| ParseError {
            line: index + 1,
            message,
        })?;
    }
    parser.finish().map_err(|message| ParseError {
        line: last,
        message,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Open {
    If,
    Loop,
}

#[derive(Default)]
struct Parser<'a> {
    builder: Option<ShaderBuilder>,
    values: HashMap<&'a str, SsaDef>,
    vars: HashMap<&'a str, VarId>,
    open: Vec<Open>,
    inputs: u32,
    outputs: u32,
}

/// Split `head {attrs}` into its two halves.
fn split_attrs(line: &str) -> PResult<(&str, Option<&str>)> {
    match line.find('{') {
        None => Ok((line, None)),
        Some(start) => {
            let rest = &line[start + 1..];
            let end = rest
                .find('}')
                .ok_or_else(|| "unterminated '{'".to_string())?;
            if !rest[end + 1..].trim().is_empty() {
                return Err(format!("unexpected text after '}}': {}", rest[end + 1..].trim()));
            }
            Ok((line[..start].trim(), Some(&rest[..end])))
        }
    }
}

/// `key=value` or bare `flag` attributes.
fn attr_pairs(text: &str) -> impl Iterator<Item = (&str, Option<&str>)> {
    text.split_whitespace().map(|item| match item.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (item, None),
    })
}

fn parse_u64(text: &str) -> PResult<u64> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };
    parsed.map_err(|_| format!("invalid number '{text}'"))
}

fn parse_u32(text: &str) -> PResult<u32> {
    u32::try_from(parse_u64(text)?).map_err(|_| format!("'{text}' does not fit in 32 bits"))
}

fn required<'a>(key: &str, value: Option<&'a str>) -> PResult<&'a str> {
    value.ok_or_else(|| format!("'{key}' needs a value"))
}

/// Constant literal as raw bits of `bit_size`.
fn parse_literal(text: &str, bit_size: u8) -> PResult<u64> {
    let is_float = text.contains('.') || text.contains("inf") || text.contains("nan")
        || (!text.starts_with("0x") && text.contains('e'));
    if is_float {
        return match bit_size {
            64 => text
                .parse::<f64>()
                .map(f64::to_bits)
                .map_err(|_| format!("invalid float '{text}'")),
            _ => text
                .parse::<f32>()
                .map(|f| u64::from(f.to_bits()))
                .map_err(|_| format!("invalid float '{text}'")),
        };
    }
    let value = match text.strip_prefix('-') {
        Some(magnitude) => parse_u64(magnitude)?.wrapping_neg(),
        None => parse_u64(text)?,
    };
    Ok(match bit_size {
        64 => value,
        bits => value & ((1u64 << bits) - 1),
    })
}

fn swizzle_component(c: char) -> PResult<u8> {
    match c {
        'x' => Ok(0),
        'y' => Ok(1),
        'z' => Ok(2),
        'w' => Ok(3),
        other => Err(format!("invalid swizzle component '{other}'")),
    }
}

impl<'a> Parser<'a> {
    fn builder(&mut self) -> PResult<&mut ShaderBuilder> {
        self.builder
            .as_mut()
            .ok_or_else(|| "expected a 'stage' line first".to_string())
    }

    fn finish(self) -> PResult<Shader> {
        let builder = self
            .builder
            .ok_or_else(|| "shader has no 'stage' line".to_string())?;
        builder.finish().map_err(|e| e.to_string())
    }

    fn parse_line(&mut self, line: &'a str) -> PResult<()> {
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };
        match keyword {
            "stage" => {
                if self.builder.is_some() {
                    return Err("duplicate 'stage' line".to_string());
                }
                let stage = Stage::from_name(rest).ok_or_else(|| format!("unknown stage '{rest}'"))?;
                self.builder = Some(ShaderBuilder::new(stage));
                Ok(())
            }
            "info" => self.parse_info(rest),
            "input" | "output" => self.parse_io(keyword == "input", rest),
            "var" => self.parse_var(rest),
            "if" => {
                let body = rest
                    .strip_suffix('{')
                    .ok_or_else(|| "'if' line must end with '{'".to_string())?
                    .trim();
                let (cond, uniform) = match body.strip_suffix("uniform") {
                    Some(cond) => (cond.trim(), true),
                    None => (body, false),
                };
                let (src, swizzle) = self.parse_src(cond)?;
                if swizzle.is_some() {
                    return Err("if condition cannot be swizzled".to_string());
                }
                self.builder()?.begin_if(src, uniform);
                self.open.push(Open::If);
                Ok(())
            }
            "loop" => {
                let body = rest
                    .strip_suffix('{')
                    .ok_or_else(|| "'loop' line must end with '{'".to_string())?
                    .trim();
                let uniform = match body {
                    "" => false,
                    "uniform" => true,
                    other => return Err(format!("unexpected '{other}' after loop")),
                };
                self.builder()?.begin_loop(uniform);
                self.open.push(Open::Loop);
                Ok(())
            }
            "}" => self.parse_close(rest),
            "break" | "continue" | "return" if rest.is_empty() => {
                let kind = match keyword {
                    "break" => JumpKind::Break,
                    "continue" => JumpKind::Continue,
                    _ => JumpKind::Return,
                };
                self.builder()?.jump(kind);
                Ok(())
            }
            _ => self.parse_instr(line),
        }
    }

    fn parse_close(&mut self, rest: &str) -> PResult<()> {
        let top = self.open.last().copied().ok_or_else(|| "unmatched '}'".to_string())?;
        if rest.is_empty() {
            self.open.pop();
            return match top {
                Open::If => self.builder()?.end_if(),
                Open::Loop => self.builder()?.end_loop(),
            }
            .map_err(|e| e.to_string());
        }
        let else_rest = rest
            .strip_prefix("else")
            .map(str::trim)
            .ok_or_else(|| format!("unexpected '{rest}' after '}}'"))?;
        if else_rest != "{" || top != Open::If {
            return Err("malformed '} else {'".to_string());
        }
        self.builder()?.begin_else().map_err(|e| e.to_string())
    }

    fn parse_info(&mut self, rest: &str) -> PResult<()> {
        let info = self.builder()?.info_mut();
        for (key, value) in attr_pairs(rest) {
            match key {
                "name" => info.name = required(key, value)?.to_string(),
                "early_fragment_tests" => info.early_fragment_tests = true,
                "reads_instance_id" => info.reads_instance_id = true,
                "reads_vertex_id" => info.reads_vertex_id = true,
                "shared_size" => info.shared_size = parse_u32(required(key, value)?)?,
                "scratch_size" => info.scratch_size = parse_u32(required(key, value)?)?,
                "local_size" => {
                    let dims: Vec<u32> = required(key, value)?
                        .split(',')
                        .map(parse_u32)
                        .collect::<PResult<_>>()?;
                    info.local_size = dims
                        .try_into()
                        .map_err(|_| "local_size needs three dimensions".to_string())?;
                }
                other => return Err(format!("unknown info key '{other}'")),
            }
        }
        Ok(())
    }

    fn parse_io(&mut self, is_input: bool, rest: &str) -> PResult<()> {
        let (name, attrs) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| "I/O declaration needs a name and attributes".to_string())?;
        let counter = if is_input { self.inputs } else { self.outputs };
        let mut var = IoVariable::new(name, 0, counter, 4);
        let mut has_location = false;
        for (key, value) in attr_pairs(attrs) {
            match key {
                "loc" => {
                    var.location = parse_u32(required(key, value)?)?;
                    has_location = true;
                }
                "driver" => var.driver_location = parse_u32(required(key, value)?)?,
                "comps" => var.num_components = parse_u32(required(key, value)?)? as u8,
                "frac" => var.location_frac = parse_u32(required(key, value)?)? as u8,
                "array" => var.array_len = parse_u32(required(key, value)?)?,
                "centroid" => var.centroid = true,
                "type" => {
                    var.base_type = match required(key, value)? {
                        "float" => BaseType::Float,
                        "int" => BaseType::Int,
                        "uint" => BaseType::Uint,
                        "bool" => BaseType::Bool,
                        other => return Err(format!("unknown base type '{other}'")),
                    }
                }
                "interp" => {
                    var.interpolation = match required(key, value)? {
                        "none" => Interpolation::None,
                        "smooth" => Interpolation::Smooth,
                        "noperspective" => Interpolation::NoPerspective,
                        "flat" => Interpolation::Flat,
                        other => return Err(format!("unknown interpolation '{other}'")),
                    }
                }
                other => return Err(format!("unknown I/O key '{other}'")),
            }
        }
        if !has_location {
            return Err(format!("'{name}' has no loc"));
        }
        if is_input {
            self.inputs += 1;
            self.builder()?.input(var);
        } else {
            self.outputs += 1;
            self.builder()?.output(var);
        }
        Ok(())
    }

    fn parse_var(&mut self, rest: &'a str) -> PResult<()> {
        let (name, attrs) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let name = name
            .strip_prefix('$')
            .ok_or_else(|| format!("variable name '{name}' must start with '$'"))?;
        let mut var = Variable {
            name: name.to_string(),
            num_components: 1,
            bit_size: 32,
            array_len: 0,
            zero_init: false,
        };
        for (key, value) in attr_pairs(attrs) {
            match key {
                "comps" => var.num_components = parse_u32(required(key, value)?)? as u8,
                "bits" => var.bit_size = parse_u32(required(key, value)?)? as u8,
                "array" => var.array_len = parse_u32(required(key, value)?)?,
                "zero_init" => var.zero_init = true,
                other => return Err(format!("unknown variable key '{other}'")),
            }
        }
        if self.vars.contains_key(name) {
            return Err(format!("variable ${name} declared twice"));
        }
        let id = self.builder()?.variable(var);
        self.vars.insert(name, id);
        Ok(())
    }

    fn lookup(&self, name: &str) -> PResult<SsaDef> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| format!("undefined value %{name}"))
    }

    fn parse_var_ref(&self, text: &str) -> PResult<VarRef> {
        let (body, component) = match text.rsplit_once('.') {
            Some((body, c)) if c.len() == 1 && !body.ends_with('[') => {
                let c = c.chars().next().ok_or_else(|| "empty component".to_string())?;
                (body, swizzle_component(c)?)
            }
            _ => (text, 0),
        };
        let (name, index) = match body.split_once('[') {
            Some((name, index)) => (
                name,
                Some(
                    index
                        .strip_suffix(']')
                        .ok_or_else(|| format!("unterminated index in '{text}'"))?,
                ),
            ),
            None => (body, None),
        };
        let var = *self
            .vars
            .get(name)
            .ok_or_else(|| format!("undeclared variable ${name}"))?;
        let mut vref = VarRef::direct(var);
        vref.component = component;
        if let Some(index) = index {
            if let Some(dynamic) = index.strip_prefix('%') {
                let (value, base) = match dynamic.split_once('+') {
                    Some((value, base)) => (value, parse_u32(base.trim())?),
                    None => (dynamic, 0),
                };
                vref.indirect = Some(self.lookup(value.trim())?.id);
                vref.base_offset = base;
            } else {
                vref.base_offset = parse_u32(index.trim())?;
            }
        }
        Ok(vref)
    }

    /// A source operand with its optional swizzle.
    fn parse_src(&self, text: &str) -> PResult<(Src, Option<Vec<u8>>)> {
        if let Some(var) = text.strip_prefix('$') {
            return Ok((Src::Var(self.parse_var_ref(var)?), None));
        }
        let body = text
            .strip_prefix('%')
            .ok_or_else(|| format!("expected a source, found '{text}'"))?;
        let (name, swizzle) = match body.split_once('.') {
            Some((name, swizzle)) => {
                let comps = swizzle
                    .chars()
                    .map(swizzle_component)
                    .collect::<PResult<Vec<u8>>>()?;
                if comps.is_empty() || comps.len() > 4 {
                    return Err(format!("invalid swizzle in '{text}'"));
                }
                (name, Some(comps))
            }
            None => (body, None),
        };
        Ok((Src::Ssa(self.lookup(name)?.id), swizzle))
    }

    /// A source that must not carry a swizzle.
    fn plain_src(&self, text: &str) -> PResult<Src> {
        match self.parse_src(text)? {
            (src, None) => Ok(src),
            (_, Some(_)) => Err(format!("'{text}' cannot be swizzled here")),
        }
    }

    fn src_components(&self, src: &Src) -> u8 {
        match src {
            Src::Ssa(id) => self
                .values
                .values()
                .find(|def| def.id == *id)
                .map(|def| def.num_components)
                .unwrap_or(1),
            Src::Var(_) => 1,
        }
    }

    fn parse_instr(&mut self, line: &'a str) -> PResult<()> {
        let (head, attrs) = split_attrs(line)?;
        let (dest, rhs) = match head.split_once('=') {
            Some((dest, rhs)) => (Some(dest.trim()), rhs.trim()),
            None => (None, head),
        };
        let mut words = rhs.split_whitespace();
        let op = words.next().ok_or_else(|| "missing operation".to_string())?;
        let args: Vec<&'a str> = words.collect();

        match op {
            "load_const" => {
                let (name, shape) = self.ssa_dest(dest, op)?;
                let values = args
                    .iter()
                    .map(|a| parse_literal(a, shape.1))
                    .collect::<PResult<Vec<u64>>>()?;
                if values.len() != shape.0 as usize {
                    return Err(format!(
                        "load_const has {} values for {} components",
                        values.len(),
                        shape.0
                    ));
                }
                let def = self.builder()?.load_const(shape.1, &values);
                self.define(name, def)
            }
            "undef" => {
                let (name, (comps, bits)) = self.ssa_dest(dest, op)?;
                let def = self.builder()?.undef(comps, bits);
                self.define(name, def)
            }
            _ => {
                if let Some(alu) = AluOp::from_name(op) {
                    self.parse_alu(alu, dest, &args)
                } else if let Some(intrinsic) = Intrinsic::from_name(op) {
                    self.parse_intrinsic(intrinsic, dest, &args, attrs)
                } else if let Some(tex) = TexOp::from_name(op) {
                    self.parse_tex(tex, dest, &args, attrs)
                } else {
                    Err(format!("unknown operation '{op}'"))
                }
            }
        }
    }

    /// `%name:BITSxCOMPS`, returning the name and `(components, bit_size)`.
    fn ssa_dest(&self, dest: Option<&'a str>, op: &str) -> PResult<(&'a str, (u8, u8))> {
        let dest = dest.ok_or_else(|| format!("{op} needs a destination"))?;
        let body = dest
            .strip_prefix('%')
            .ok_or_else(|| format!("{op} needs an SSA destination"))?;
        let (name, shape) = body
            .split_once(':')
            .ok_or_else(|| format!("destination '{dest}' has no ':BITSxCOMPS' shape"))?;
        let (bits, comps) = shape
            .split_once('x')
            .ok_or_else(|| format!("invalid shape '{shape}'"))?;
        let bits = parse_u32(bits)? as u8;
        let comps = parse_u32(comps)? as u8;
        if !matches!(bits, 1 | 8 | 16 | 32 | 64) {
            return Err(format!("invalid bit size {bits}"));
        }
        if !(1..=4).contains(&comps) {
            return Err(format!("invalid component count {comps}"));
        }
        Ok((name, (comps, bits)))
    }

    fn define(&mut self, name: &'a str, def: SsaDef) -> PResult<()> {
        if self.values.insert(name, def).is_some() {
            return Err(format!("%{name} is defined twice"));
        }
        Ok(())
    }

    /// Destination of an instruction that may write an SSA value or a variable.
    fn parse_dest(&mut self, dest: &'a str, op: &str) -> PResult<(Dest, Option<&'a str>)> {
        if let Some(var) = dest.strip_prefix('$') {
            return Ok((Dest::Var(self.parse_var_ref(var)?), None));
        }
        let (name, (comps, bits)) = self.ssa_dest(Some(dest), op)?;
        let def = self.builder()?.def(comps, bits);
        Ok((Dest::Ssa(def), Some(name)))
    }

    fn parse_alu(&mut self, op: AluOp, dest: Option<&'a str>, args: &[&str]) -> PResult<()> {
        if args.len() != op.info().num_srcs {
            return Err(format!(
                "{op} takes {} sources, found {}",
                op.info().num_srcs,
                args.len()
            ));
        }
        let srcs = args
            .iter()
            .map(|arg| {
                let (src, swizzle) = self.parse_src(arg)?;
                Ok(match swizzle {
                    None => AluSrc::new(src),
                    Some(comps) => {
                        let last = comps[comps.len() - 1];
                        let mut swizzle = [last; 4];
                        swizzle[..comps.len()].copy_from_slice(&comps);
                        AluSrc { src, swizzle }
                    }
                })
            })
            .collect::<PResult<Vec<AluSrc>>>()?;
        let dest = dest.ok_or_else(|| format!("{op} needs a destination"))?;
        let (dest, name) = self.parse_dest(dest, op.info().name)?;
        self.builder()?.push(Instr::Alu(crate::ir::AluInstr { op, dest, srcs }));
        match (name, dest) {
            (Some(name), Dest::Ssa(def)) => self.define(name, def),
            _ => Ok(()),
        }
    }

    fn parse_intrinsic(
        &mut self,
        op: Intrinsic,
        dest: Option<&'a str>,
        args: &[&str],
        attrs: Option<&str>,
    ) -> PResult<()> {
        let srcs = args
            .iter()
            .map(|arg| self.plain_src(arg))
            .collect::<PResult<Vec<Src>>>()?;

        let mut indices = IntrinsicIndices::default();
        let mut num_components = None;
        for (key, value) in attr_pairs(attrs.unwrap_or("")) {
            match key {
                "base" => indices.base = parse_u32(required(key, value)?)?,
                "component" => indices.component = parse_u32(required(key, value)?)? as u8,
                "write_mask" => indices.write_mask = parse_u32(required(key, value)?)? as u16,
                "ucp_id" => indices.ucp_id = parse_u32(required(key, value)?)?,
                "range" => indices.range = parse_u32(required(key, value)?)?,
                "image_dim" | "dim" => {
                    let name = required(key, value)?;
                    indices.image_dim = SamplerDim::from_name(name)
                        .ok_or_else(|| format!("unknown sampler dim '{name}'"))?;
                }
                "image_array" | "array" => indices.image_array = true,
                "num_components" => num_components = Some(parse_u32(required(key, value)?)? as u8),
                other => return Err(format!("unknown intrinsic index '{other}'")),
            }
        }

        let (dest, name) = match dest {
            Some(dest) => {
                let (dest, name) = self.parse_dest(dest, &op.to_string())?;
                (Some(dest), name)
            }
            None => (None, None),
        };
        let value_src = match op {
            Intrinsic::ImageStore => srcs.get(2),
            _ => srcs.first(),
        };
        let num_components = match (num_components, dest) {
            (Some(n), _) => n,
            (None, Some(Dest::Ssa(def))) => def.num_components,
            (None, Some(Dest::Var(_))) => 1,
            (None, None) => value_src.map(|s| self.src_components(s)).unwrap_or(1),
        };

        self.builder()?.push(Instr::Intrinsic(IntrinsicInstr {
            op,
            srcs,
            dest,
            num_components,
            indices,
        }));
        match (name, dest) {
            (Some(name), Some(Dest::Ssa(def))) => self.define(name, def),
            _ => Ok(()),
        }
    }

    fn parse_tex(
        &mut self,
        op: TexOp,
        dest: Option<&'a str>,
        args: &[&str],
        attrs: Option<&str>,
    ) -> PResult<()> {
        let mut srcs = Vec::with_capacity(args.len());
        for arg in args {
            let (kind, src) = arg
                .split_once('=')
                .ok_or_else(|| format!("texture source '{arg}' must be 'kind=src'"))?;
            let kind = TexSrcKind::from_name(kind)
                .ok_or_else(|| format!("unknown texture source kind '{kind}'"))?;
            let src = self.plain_src(src)?;
            srcs.push(TexSrc {
                kind,
                num_components: self.src_components(&src),
                src,
            });
        }

        let (name, (comps, bits)) = self.ssa_dest(dest, op.name())?;
        let def = self.builder()?.def(comps, bits);
        let mut instr = TexInstr {
            op,
            dest: def,
            srcs,
            texture_index: 0,
            sampler_index: 0,
            dim: SamplerDim::Dim2D,
            is_array: false,
            is_shadow: false,
            component: 0,
        };
        let mut sampler = None;
        for (key, value) in attr_pairs(attrs.unwrap_or("")) {
            match key {
                "texture" => instr.texture_index = parse_u32(required(key, value)?)?,
                "sampler" => sampler = Some(parse_u32(required(key, value)?)?),
                "dim" => {
                    let name = required(key, value)?;
                    instr.dim = SamplerDim::from_name(name)
                        .ok_or_else(|| format!("unknown sampler dim '{name}'"))?;
                }
                "array" => instr.is_array = true,
                "shadow" => instr.is_shadow = true,
                "component" => instr.component = parse_u32(required(key, value)?)? as u8,
                other => return Err(format!("unknown texture parameter '{other}'")),
            }
        }
        instr.sampler_index = sampler.unwrap_or(instr.texture_index);
        self.builder()?.push(Instr::Tex(instr));
        self.define(name, def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::CfNode;

    #[test]
    fn test_parse_header_and_alu() {
        let text = "\
stage fragment
info name=blend early_fragment_tests
input v_color loc=32 comps=4 interp=smooth
output color loc=2 comps=4
var $acc comps=1 bits=32 array=4

%one:32x1 = load_const 1.0
%c:32x4 = load_input %zero {base=0}
";
        // %zero is used before it is defined.
        let err = parse_shader(text).unwrap_err();
        assert_eq!(err.line, 8);
        assert!(err.message.contains("%zero"));

        let text = text.replace("%c:32x4 = load_input %zero", "%zero:32x1 = load_const 0\n%c:32x4 = load_input %zero");
        let text = format!("{text}%sum:32x1 = fadd %c.w %one\n$acc[%zero+1] = mov %sum\n");
        let shader = parse_shader(&text).unwrap();
        assert_eq!(shader.stage, Stage::Fragment);
        assert_eq!(shader.info.name, "blend");
        assert!(shader.info.early_fragment_tests);
        assert_eq!(shader.inputs[0].interpolation, Interpolation::Smooth);
        assert_eq!(shader.outputs[0].location, 2);
        assert_eq!(shader.variables[0].array_len, 4);
        assert_eq!(shader.ssa_count, 4);

        let instrs: Vec<_> = shader.instrs().collect();
        match instrs[3] {
            Instr::Alu(alu) => {
                assert_eq!(alu.op, AluOp::Fadd);
                assert_eq!(alu.srcs[0].swizzle, [3; 4]);
            }
            other => panic!("expected fadd, got {other:?}"),
        }
        match instrs[4] {
            Instr::Alu(crate::ir::AluInstr { dest: Dest::Var(vref), .. }) => {
                assert_eq!(vref.base_offset, 1);
                assert!(vref.indirect.is_some());
            }
            other => panic!("expected variable store, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_control_flow() {
        let text = "\
stage compute
%a:32x1 = load_const 3
%b:32x1 = load_const 4
%c:1x1 = ilt %a %b
if %c {
  loop uniform {
    break
  }
} else {
  return
}
";
        let shader = parse_shader(text).unwrap();
        assert_eq!(shader.body.len(), 2);
        match &shader.body[1] {
            CfNode::If(node) => {
                assert!(!node.uniform);
                assert!(matches!(&node.then_body[0], CfNode::Loop(l) if l.uniform));
                assert_eq!(node.else_body.len(), 1);
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_tex_and_intrinsics() {
        let text = "\
stage fragment
%coord:32x2 = load_const 0.5 0.5
%lod:32x1 = load_const 0
%t:16x4 = tex coord=%coord lod=%lod {texture=1 dim=2d shadow}
%zero:32x1 = load_const 0
store_output %t %zero {base=0 write_mask=0xf}
";
        let shader = parse_shader(text).unwrap();
        let instrs: Vec<_> = shader.instrs().collect();
        match instrs[2] {
            Instr::Tex(tex) => {
                assert_eq!(tex.texture_index, 1);
                assert_eq!(tex.sampler_index, 1);
                assert!(tex.is_shadow);
                assert_eq!(tex.dest.bit_size, 16);
                assert_eq!(tex.srcs[0].num_components, 2);
            }
            other => panic!("expected tex, got {other:?}"),
        }
        match instrs[4] {
            Instr::Intrinsic(intr) => {
                assert_eq!(intr.op, Intrinsic::StoreOutput);
                assert_eq!(intr.num_components, 4);
                assert_eq!(intr.indices.write_mask, 0xf);
            }
            other => panic!("expected store_output, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        let cases = [
            ("%a:32x1 = load_const 1", 1, "stage"),
            ("stage fragment\n}", 2, "unmatched"),
            ("stage fragment\n%a:32x1 = frobnicate", 2, "unknown operation"),
            ("stage fragment\n%a:32x1 = load_const 1\n%a:32x1 = load_const 2", 3, "twice"),
            ("stage fragment\n%a:32x1 = load_const 1\nif %a {", 3, "left open"),
            ("stage fragment\n%a:32x2 = load_const 1", 2, "2 components"),
        ];
        for (text, line, needle) in cases {
            let err = parse_shader(text).unwrap_err();
            assert_eq!(err.line, line, "{text}");
            assert!(err.message.contains(needle), "{}: {}", text, err.message);
        }
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_literal("1.0", 32).unwrap(), 0x3f80_0000);
        assert_eq!(parse_literal("-1", 32).unwrap(), 0xffff_ffff);
        assert_eq!(parse_literal("-1", 16).unwrap(), 0xffff);
        assert_eq!(parse_literal("0x10", 32).unwrap(), 16);
        assert_eq!(parse_literal("2.0", 64).unwrap(), 2.0f64.to_bits());
    }
}
