//! Feed parsing: raw XML from the venue/event endpoints into draft records.

use cps_core::{ProgrammeDraft, VenueDraft};
use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "cps-feed";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed feed XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("unexpected feed root element <{found}>, expected <{expected}>")]
    UnexpectedRoot { expected: &'static str, found: String },
}

/// Parses the venue feed.
///
/// Schema: `<venues><venue id="..."><name/><latitude/><longitude/></venue>...</venues>`.
/// Coordinates are parsed leniently: unparsable or missing values become `None`.
/// Entries without an `id` attribute are logged and skipped, not fatal.
pub fn parse_venue_feed(xml: &str) -> Result<Vec<VenueDraft>, ParseError> {
    let doc = Document::parse(xml)?;
    let root = expect_root(&doc, "venues")?;

    let mut drafts = Vec::new();
    for node in root.children().filter(|n| n.has_tag_name("venue")) {
        let Some(venue_id) = id_attr(&node) else {
            warn!("venue entry without id attribute skipped");
            continue;
        };
        drafts.push(VenueDraft {
            venue_id,
            name: child_text(&node, "name").unwrap_or_default(),
            latitude: child_f64(&node, "latitude"),
            longitude: child_f64(&node, "longitude"),
        });
    }
    Ok(drafts)
}

/// Parses the event feed.
///
/// Schema: `<events><event id="..."><title/><venueid/><predate/><duration/>
/// <price/><desc/><presenter/><type/><language/><remark/><url/><enquiry/>
/// <submitdate/></event>...</events>`. Missing child elements become `None`;
/// `submitdate` is carried raw and derived into an epoch by the reconciler.
pub fn parse_event_feed(xml: &str) -> Result<Vec<ProgrammeDraft>, ParseError> {
    let doc = Document::parse(xml)?;
    let root = expect_root(&doc, "events")?;

    let mut drafts = Vec::new();
    for node in root.children().filter(|n| n.has_tag_name("event")) {
        let Some(event_id) = id_attr(&node) else {
            warn!("event entry without id attribute skipped");
            continue;
        };
        drafts.push(ProgrammeDraft {
            event_id,
            title: child_text(&node, "title"),
            venue_id: child_text(&node, "venueid"),
            dateline: child_text(&node, "predate"),
            duration: child_text(&node, "duration"),
            price: child_text(&node, "price"),
            description: child_text(&node, "desc"),
            presenter: child_text(&node, "presenter"),
            programme_type: child_text(&node, "type"),
            language: child_text(&node, "language"),
            remarks: child_text(&node, "remark"),
            url: child_text(&node, "url"),
            enquiry: child_text(&node, "enquiry"),
            submit_date: child_text(&node, "submitdate"),
        });
    }
    Ok(drafts)
}

fn expect_root<'a>(doc: &'a Document<'a>, expected: &'static str) -> Result<Node<'a, 'a>, ParseError> {
    let root = doc.root_element();
    if root.has_tag_name(expected) {
        Ok(root)
    } else {
        Err(ParseError::UnexpectedRoot {
            expected,
            found: root.tag_name().name().to_string(),
        })
    }
}

fn id_attr(node: &Node<'_, '_>) -> Option<String> {
    node.attribute("id")
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn child_text(node: &Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .find(|c| c.has_tag_name(name))
        .and_then(|c| c.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn child_f64(node: &Node<'_, '_>, name: &str) -> Option<f64> {
    child_text(node, name).and_then(|t| t.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VENUES_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<venues>
  <venue id="50130021">
    <name>Hong Kong City Hall (Concert Hall)</name>
    <latitude>22.2822</latitude>
    <longitude>114.1617</longitude>
  </venue>
  <venue id="36906">
    <name>Sha Tin Town Hall</name>
    <latitude>not-a-number</latitude>
    <longitude></longitude>
  </venue>
  <venue id="  ">
    <name>Ghost Venue</name>
  </venue>
</venues>"#;

    const EVENTS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<events>
  <event id="118706">
    <title>Evening Gala Concert</title>
    <venueid>50130021</venueid>
    <predate>3-4 Aug 2021</predate>
    <duration>1 hr 30 mins</duration>
    <price>$180, $120</price>
    <desc>An evening of orchestral favourites.</desc>
    <presenter>City Chamber Orchestra</presenter>
    <type>Music</type>
    <language>Cantonese</language>
    <remark>No latecomers</remark>
    <url>https://example.org/gala</url>
    <enquiry>23456789</enquiry>
    <submitdate>2021-06-01 11:05:33</submitdate>
  </event>
  <event id="118707">
    <title></title>
    <venueid>36906</venueid>
  </event>
</events>"#;

    #[test]
    fn venue_feed_parses_ids_names_and_coordinates() {
        let drafts = parse_venue_feed(VENUES_XML).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].venue_id, "50130021");
        assert_eq!(drafts[0].name, "Hong Kong City Hall (Concert Hall)");
        assert_eq!(drafts[0].latitude, Some(22.2822));
        assert_eq!(drafts[0].longitude, Some(114.1617));
    }

    #[test]
    fn venue_feed_coordinates_are_lenient() {
        let drafts = parse_venue_feed(VENUES_XML).unwrap();
        assert_eq!(drafts[1].latitude, None);
        assert_eq!(drafts[1].longitude, None);
    }

    #[test]
    fn venue_without_id_is_skipped() {
        let drafts = parse_venue_feed(VENUES_XML).unwrap();
        assert!(drafts.iter().all(|d| !d.name.contains("Ghost")));
    }

    #[test]
    fn event_feed_parses_all_descriptive_fields() {
        let drafts = parse_event_feed(EVENTS_XML).unwrap();
        assert_eq!(drafts.len(), 2);
        let e = &drafts[0];
        assert_eq!(e.event_id, "118706");
        assert_eq!(e.title.as_deref(), Some("Evening Gala Concert"));
        assert_eq!(e.venue_id.as_deref(), Some("50130021"));
        assert_eq!(e.dateline.as_deref(), Some("3-4 Aug 2021"));
        assert_eq!(e.duration.as_deref(), Some("1 hr 30 mins"));
        assert_eq!(e.price.as_deref(), Some("$180, $120"));
        assert_eq!(e.programme_type.as_deref(), Some("Music"));
        assert_eq!(e.language.as_deref(), Some("Cantonese"));
        assert_eq!(e.submit_date.as_deref(), Some("2021-06-01 11:05:33"));
    }

    #[test]
    fn empty_elements_become_none() {
        let drafts = parse_event_feed(EVENTS_XML).unwrap();
        let e = &drafts[1];
        assert_eq!(e.title, None);
        assert_eq!(e.price, None);
        assert_eq!(e.submit_date, None);
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse_venue_feed("<venues><venue id=\"1\">").unwrap_err();
        assert!(matches!(err, ParseError::Xml(_)));
    }

    #[test]
    fn wrong_root_element_is_rejected() {
        let err = parse_event_feed("<venues></venues>").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedRoot { expected: "events", .. }));
    }
}
