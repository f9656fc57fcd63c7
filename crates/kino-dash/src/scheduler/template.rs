//! Segment URL templates
//!
//! Only `%0[width]d` formatting is permitted inside identifiers, so the
//! template is parsed once into literal and identifier parts and resolved
//! without a printf implementation.
//!
//! Example template: `$RepresentationID$/$Number%06d$.m4s`

use crate::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till1},
    character::complete::{alpha1, char, digit1},
    combinator::{all_consuming, map_res, opt},
    multi::many0,
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

/// Known template identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    RepresentationId,
    Number,
    Time,
    Bandwidth,
    /// Left untouched on resolution
    Unknown(String),
}

impl Identifier {
    fn from_name(name: &str) -> Self {
        match name {
            "RepresentationID" => Identifier::RepresentationId,
            "Number" => Identifier::Number,
            "Time" => Identifier::Time,
            "Bandwidth" => Identifier::Bandwidth,
            other => Identifier::Unknown(other.to_string()),
        }
    }
}

/// A parsed template fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Literal(String),
    Identifier {
        identifier: Identifier,
        width: Option<usize>,
    },
}

/// Values substituted into a template
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateArgs<'a> {
    pub representation_id: &'a str,
    pub number: Option<u64>,
    pub time: Option<u64>,
    pub bandwidth: Option<u64>,
}

/// Parsed URL template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    parts: Vec<TemplatePart>,
}

fn escaped_dollar(input: &str) -> IResult<&str, TemplatePart> {
    tag("$$")
        .map(|_| TemplatePart::Literal("$".to_string()))
        .parse(input)
}

fn width(input: &str) -> IResult<&str, usize> {
    preceded(
        tag("%0"),
        terminated(map_res(digit1, |d: &str| d.parse::<usize>()), char('d')),
    )
    .parse(input)
}

fn identifier(input: &str) -> IResult<&str, TemplatePart> {
    delimited(char('$'), (alpha1, opt(width)), char('$'))
        .map(|(name, width)| TemplatePart::Identifier {
            identifier: Identifier::from_name(name),
            width,
        })
        .parse(input)
}

fn literal(input: &str) -> IResult<&str, TemplatePart> {
    take_till1(|c: char| c == '$')
        .map(|s: &str| TemplatePart::Literal(s.to_string()))
        .parse(input)
}

fn template(input: &str) -> IResult<&str, Vec<TemplatePart>> {
    all_consuming(many0(alt((escaped_dollar, identifier, literal)))).parse(input)
}

fn pad_number(value: u64, width: Option<usize>) -> String {
    match width {
        Some(width) => format!("{value:0width$}"),
        None => value.to_string(),
    }
}

impl UrlTemplate {
    /// Parse a template string
    pub fn parse(source: &str) -> Result<Self> {
        let (_, parts) = template(source)
            .map_err(|e| Error::InvalidTemplate(format!("{source}: {e}")))?;
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[TemplatePart] {
        &self.parts
    }

    /// Does the template use `$Time$`
    pub fn uses_time(&self) -> bool {
        self.has(&Identifier::Time)
    }

    /// Does the template use `$Number$`
    pub fn uses_number(&self) -> bool {
        self.has(&Identifier::Number)
    }

    fn has(&self, wanted: &Identifier) -> bool {
        self.parts.iter().any(|part| {
            matches!(part, TemplatePart::Identifier { identifier, .. } if identifier == wanted)
        })
    }

    /// Substitute identifiers; identifiers without a value are kept verbatim
    pub fn resolve(&self, args: &TemplateArgs<'_>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            self.append_part(part, args, &mut out);
        }
        out
    }

    fn append_part(&self, part: &TemplatePart, args: &TemplateArgs<'_>, dst: &mut String) {
        match part {
            TemplatePart::Literal(text) => dst.push_str(text),
            TemplatePart::Identifier { identifier, width } => {
                let value = match identifier {
                    Identifier::RepresentationId => Some(match width {
                        Some(width) => format!("{:0>width$}", args.representation_id),
                        None => args.representation_id.to_string(),
                    }),
                    Identifier::Number => args.number.map(|n| pad_number(n, *width)),
                    Identifier::Time => args.time.map(|t| pad_number(t, *width)),
                    Identifier::Bandwidth => args.bandwidth.map(|b| pad_number(b, *width)),
                    Identifier::Unknown(_) => None,
                };
                match value {
                    Some(value) => dst.push_str(&value),
                    None => dst.push_str(&Self::source_text(identifier, *width)),
                }
            }
        }
    }

    fn source_text(identifier: &Identifier, width: Option<usize>) -> String {
        let name = match identifier {
            Identifier::RepresentationId => "RepresentationID",
            Identifier::Number => "Number",
            Identifier::Time => "Time",
            Identifier::Bandwidth => "Bandwidth",
            Identifier::Unknown(name) => name.as_str(),
        };
        match width {
            Some(width) => format!("${name}%0{width}d$"),
            None => format!("${name}$"),
        }
    }

    /// Recover `$Number$` from a resolved segment name
    ///
    /// The name may be a full URL or just its last path components; the
    /// text around the number must match the resolved template.
    pub fn extract_number(&self, name: &str, args: &TemplateArgs<'_>) -> Option<u64> {
        let split = self.parts.iter().position(|part| {
            matches!(part, TemplatePart::Identifier { identifier: Identifier::Number, .. })
        })?;

        let mut prefix = String::new();
        for part in &self.parts[..split] {
            self.append_part(part, args, &mut prefix);
        }
        let mut suffix = String::new();
        for part in &self.parts[split + 1..] {
            self.append_part(part, args, &mut suffix);
        }
        if suffix.contains('$') {
            return None;
        }

        let name = name.split(['?', '#']).next().unwrap_or(name);
        let head = name.strip_suffix(suffix.as_str())?;
        let digits_start = head
            .rfind(|c: char| !c.is_ascii_digit())
            .map(|i| i + 1)
            .unwrap_or(0);
        let digits = &head[digits_start..];
        if digits.is_empty() {
            return None;
        }
        let before = &head[..digits_start];
        let prefix_tail = prefix.rsplit('/').next().unwrap_or(&prefix);
        if !before.ends_with(prefix_tail) {
            return None;
        }
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> TemplateArgs<'static> {
        TemplateArgs {
            representation_id: "1",
            number: Some(2),
            time: Some(3),
            bandwidth: Some(4),
        }
    }

    fn resolve(source: &str) -> String {
        UrlTemplate::parse(source).unwrap().resolve(&args())
    }

    #[test]
    fn test_template_replace() {
        // Single digit
        assert_eq!(resolve("$RepresentationID$"), "1");
        assert_eq!(resolve("$Number$"), "2");
        assert_eq!(resolve("$Time$"), "3");
        assert_eq!(resolve("$Bandwidth$"), "4");

        // Padded
        assert_eq!(resolve("$RepresentationID%02d$"), "01");
        assert_eq!(resolve("$Number%02d$"), "02");

        // Mixed variables with width
        assert_eq!(
            resolve("$RepresentationID%02d$-$Number%09d$"),
            "01-000000002"
        );
        assert_eq!(
            resolve("video/$RepresentationID$/seg-$Time$-$Bandwidth$.m4s"),
            "video/1/seg-3-4.m4s"
        );

        // Escapes and unknown identifiers
        assert_eq!(resolve("cost$$$Number$"), "cost$2");
        assert_eq!(resolve("$Unknown$"), "$Unknown$");
    }

    #[test]
    fn test_template_variable_not_defined() {
        let template = UrlTemplate::parse("$Number%05d$.m4s").unwrap();
        assert_eq!(
            template.resolve(&TemplateArgs::default()),
            "$Number%05d$.m4s"
        );
    }

    #[test]
    fn test_invalid_template() {
        assert!(UrlTemplate::parse("seg-$Number.m4s").is_err());
        assert!(UrlTemplate::parse("seg-$Number%0xd$.m4s").is_err());
    }

    #[test]
    fn test_flags() {
        let template = UrlTemplate::parse("$RepresentationID$/$Time$.m4s").unwrap();
        assert!(template.uses_time());
        assert!(!template.uses_number());
    }

    #[test]
    fn test_extract_number() {
        let template = UrlTemplate::parse("$RepresentationID$/seg-$Number%05d$.m4s").unwrap();
        let args = TemplateArgs {
            representation_id: "video",
            ..Default::default()
        };
        assert_eq!(template.extract_number("seg-00042.m4s", &args), Some(42));
        assert_eq!(
            template.extract_number("https://cdn.example.com/live/video/seg-00042.m4s?token=1", &args),
            Some(42)
        );
        assert_eq!(template.extract_number("init.mp4", &args), None);
        assert_eq!(template.extract_number("chunk-00042.m4s", &args), None);
    }

    #[test]
    fn test_number_round_trip() {
        let template = UrlTemplate::parse("$RepresentationID$_$Number$.ts").unwrap();
        for number in [0u64, 1, 9, 10, 12345] {
            let args = TemplateArgs {
                representation_id: "audio",
                number: Some(number),
                ..Default::default()
            };
            let name = template.resolve(&args);
            let lookup = TemplateArgs {
                representation_id: "audio",
                ..Default::default()
            };
            assert_eq!(template.extract_number(&name, &lookup), Some(number));
        }
    }
}
