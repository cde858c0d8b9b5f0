//!
//! printf-style formatting for `sql_format`.
//!
//! Conversions: `d i o x X c` read a cell, `f F e E g G` read a cell holding
//! float bits, `s` reads a string, `z` reads a string and escapes it through
//! the connection, `%%` is a literal percent. Flags `- + 0 #` and space,
//! a width and a precision are honoured. Anything else is logged and
//! dropped without consuming an argument.
//!

use tracing::warn;

use crate::value::{f32_from_cell, Value};

#[derive(Debug, Default, Clone, Copy)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alternate: bool,
    width: usize,
    precision: Option<usize>,
}

impl Spec {
    fn parse(body: &str) -> Spec {
        let mut spec = Spec::default();
        let mut chars = body.chars().peekable();
        while let Some(&c) = chars.peek() {
            match c {
                '-' => spec.left = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '0' => spec.zero = true,
                '#' => spec.alternate = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&c) = chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            width.push(c);
            chars.next();
        }
        spec.width = width.parse().unwrap_or(0);
        if chars.peek() == Some(&'.') {
            chars.next();
            let digits: String = chars.take_while(|c| c.is_ascii_digit()).collect();
            spec.precision = Some(digits.parse().unwrap_or(0));
        }
        spec
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }

    /// Pads a rendered number. Zero padding goes between sign and digits.
    fn pad_number(&self, sign: &str, digits: &str, zero_allowed: bool) -> String {
        let len = sign.len() + digits.len();
        if len >= self.width {
            return format!("{}{}", sign, digits);
        }
        let fill = self.width - len;
        if self.left {
            format!("{}{}{}", sign, digits, " ".repeat(fill))
        } else if self.zero && zero_allowed {
            format!("{}{}{}", sign, "0".repeat(fill), digits)
        } else {
            format!("{}{}{}", " ".repeat(fill), sign, digits)
        }
    }

    fn pad_text(&self, text: &str) -> String {
        let len = text.chars().count();
        if len >= self.width {
            return text.to_string();
        }
        let fill = " ".repeat(self.width - len);
        if self.left {
            format!("{}{}", text, fill)
        } else {
            format!("{}{}", fill, text)
        }
    }
}

fn with_min_digits(digits: String, precision: Option<usize>) -> String {
    match precision {
        Some(p) if digits.len() < p => format!("{}{}", "0".repeat(p - digits.len()), digits),
        _ => digits,
    }
}

/// C-style exponent: at least two digits, always signed.
fn exponent_form(value: f64, precision: usize, upper: bool) -> String {
    let rendered = format!("{:.*e}", precision, value);
    let (mantissa, exponent) = rendered.split_once('e').unwrap_or((rendered.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let out = format!("{}e{}{:02}", mantissa, sign, exponent.abs());
    if upper { out.to_uppercase() } else { out }
}

fn strip_fraction_zeros(text: &str) -> String {
    let (number, suffix) = match text.find(['e', 'E']) {
        Some(pos) => text.split_at(pos),
        None => (text, ""),
    };
    let number = if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    };
    format!("{}{}", number, suffix)
}

fn general_form(value: f64, precision: Option<usize>, alternate: bool, upper: bool) -> String {
    let p = match precision {
        Some(0) => 1,
        Some(p) => p,
        None => 6,
    };
    if value == 0.0 {
        let out = format!("{:.*}", p - 1, value);
        return if alternate { out } else { strip_fraction_zeros(&out) };
    }
    // Exponent after rounding to `p` significant digits.
    let rounded = format!("{:.*e}", p - 1, value);
    let exponent: i32 = rounded
        .split_once('e')
        .and_then(|(_, exp)| exp.parse().ok())
        .unwrap_or(0);
    let out = if exponent < -4 || exponent >= p as i32 {
        exponent_form(value, p - 1, upper)
    } else {
        format!("{:.*}", (p as i32 - 1 - exponent).max(0) as usize, value)
    };
    if alternate { out } else { strip_fraction_zeros(&out) }
}

fn render_float(spec: &Spec, conversion: char, value: f32) -> String {
    let value = value as f64;
    if !value.is_finite() {
        let text = if value.is_nan() {
            "nan"
        } else if value > 0.0 {
            "inf"
        } else {
            "-inf"
        };
        let text = if conversion.is_ascii_uppercase() { text.to_uppercase() } else { text.to_string() };
        return spec.pad_text(&text);
    }
    let negative = value.is_sign_negative() && value != 0.0;
    let magnitude = value.abs();
    let digits = match conversion {
        'f' | 'F' => format!("{:.*}", spec.precision.unwrap_or(6), magnitude),
        'e' | 'E' => exponent_form(magnitude, spec.precision.unwrap_or(6), conversion == 'E'),
        _ => general_form(magnitude, spec.precision, spec.alternate, conversion == 'G'),
    };
    spec.pad_number(spec.sign(negative), &digits, true)
}

fn render_int(spec: &Spec, conversion: char, value: i32) -> String {
    let zero_allowed = spec.precision.is_none();
    match conversion {
        'd' | 'i' => {
            let digits = with_min_digits(value.unsigned_abs().to_string(), spec.precision);
            spec.pad_number(spec.sign(value < 0), &digits, zero_allowed)
        }
        'o' => {
            let mut digits = with_min_digits(format!("{:o}", value as u32), spec.precision);
            if spec.alternate && !digits.starts_with('0') {
                digits.insert(0, '0');
            }
            spec.pad_number("", &digits, zero_allowed)
        }
        'x' | 'X' => {
            let digits = if conversion == 'x' {
                format!("{:x}", value as u32)
            } else {
                format!("{:X}", value as u32)
            };
            let digits = with_min_digits(digits, spec.precision);
            let prefix = match (spec.alternate && value != 0, conversion) {
                (true, 'x') => "0x",
                (true, _) => "0X",
                _ => "",
            };
            spec.pad_number(prefix, &digits, zero_allowed)
        }
        _ => {
            let c = char::from_u32(value as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
            spec.pad_text(&c.to_string())
        }
    }
}

fn truncate_chars(text: &str, precision: Option<usize>) -> &str {
    match precision {
        Some(p) => match text.char_indices().nth(p) {
            Some((end, _)) => &text[..end],
            None => text,
        },
        None => text,
    }
}

/// Formats `template` with `args`. `escape` is applied to `%z` arguments.
pub fn sprintf(template: &str, args: &[Value], escape: &dyn Fn(&str) -> String) -> String {
    let mut output = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            output.push(c);
            continue;
        }

        let mut body = String::new();
        let conversion = loop {
            match chars.next() {
                Some(next) if next.is_ascii_alphabetic() || next == '%' => break Some(next),
                Some(next) => body.push(next),
                None => break None,
            }
        };
        let Some(conversion) = conversion else {
            warn!(specifier = %format!("%{}", body), "unterminated format specifier");
            break;
        };
        let spec = Spec::parse(&body);

        match conversion {
            '%' => output.push('%'),
            'd' | 'i' | 'o' | 'x' | 'X' | 'c' => match args.next() {
                Some(Value::Cell(cell)) => output.push_str(&render_int(&spec, conversion, *cell)),
                other => warn!(conversion = %conversion, found = ?other.map(|v| v.kind_name()), "expected a cell argument"),
            },
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => match args.next() {
                Some(Value::Cell(cell)) => {
                    output.push_str(&render_float(&spec, conversion, f32_from_cell(*cell)))
                }
                other => warn!(conversion = %conversion, found = ?other.map(|v| v.kind_name()), "expected a float argument"),
            },
            's' | 'z' => match args.next() {
                Some(Value::Str(s)) => {
                    let text = if conversion == 'z' { escape(s) } else { s.clone() };
                    output.push_str(&spec.pad_text(truncate_chars(&text, spec.precision)));
                }
                other => warn!(conversion = %conversion, found = ?other.map(|v| v.kind_name()), "expected a string argument"),
            },
            other => warn!(specifier = %format!("%{}{}", body, other), "unknown format specifier"),
        }
    }
    output
}
