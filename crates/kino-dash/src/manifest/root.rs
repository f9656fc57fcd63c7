//! Root element sniffing for XML manifests

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, multispace0},
    combinator::{opt, recognize},
    multi::many0,
    sequence::preceded,
    IResult, Parser,
};

/// `<?...?>`, `<!--...-->` or `<!DOCTYPE ...>`
fn misc(input: &str) -> IResult<&str, &str> {
    alt((
        recognize((tag("<?"), take_until("?>"), tag("?>"))),
        recognize((tag("<!--"), take_until("-->"), tag("-->"))),
        recognize((tag("<!DOCTYPE"), take_until(">"), tag(">"))),
    ))
    .parse(input)
}

fn prolog(input: &str) -> IResult<&str, ()> {
    (
        opt(tag("\u{feff}")),
        many0(preceded(multispace0, misc)),
        multispace0,
    )
        .map(|_| ())
        .parse(input)
}

fn element_name(input: &str) -> IResult<&str, &str> {
    preceded(
        char('<'),
        take_while1(|c: char| c.is_alphanumeric() || matches!(c, ':' | '_' | '-' | '.')),
    )
    .parse(input)
}

/// Name of the first element of an XML document, prefix included
pub fn root_element_name(content: &str) -> Option<&str> {
    let (rest, _) = prolog(content).ok()?;
    element_name(rest).ok().map(|(_, name)| name)
}

/// Returns true when the document root element is `MPD` (any namespace prefix)
pub fn check_mpd_root_type(content: &[u8]) -> bool {
    let text = String::from_utf8_lossy(content);
    root_element_name(&text)
        .and_then(|name| name.rsplit(':').next())
        .is_some_and(|local| local == "MPD")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_root() {
        assert!(check_mpd_root_type(b"<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\"></MPD>"));
        assert!(check_mpd_root_type(b"  \n<MPD/>"));
    }

    #[test]
    fn test_prolog_skipped() {
        let doc = "\u{feff}<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
                   <!-- generated by packager -->\n\
                   <!DOCTYPE MPD>\n\
                   <MPD type=\"dynamic\">";
        assert!(check_mpd_root_type(doc.as_bytes()));
    }

    #[test]
    fn test_namespaced_root() {
        assert_eq!(root_element_name("<dash:MPD>"), Some("dash:MPD"));
        assert!(check_mpd_root_type(b"<dash:MPD></dash:MPD>"));
    }

    #[test]
    fn test_rejects_other_roots() {
        assert!(!check_mpd_root_type(b"<html><body>404</body></html>"));
        assert!(!check_mpd_root_type(b"#EXTM3U"));
        assert!(!check_mpd_root_type(b""));
        assert!(!check_mpd_root_type(b"<MPDX/>"));
    }
}
