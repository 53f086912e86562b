//! Google Drive link canonicalisation.
//!
//! Share links come in several shapes (`/file/d/<id>/view`, `/open?id=<id>`,
//! `/uc?id=<id>&export=download`, ...). Only the `uc?export=download` form can
//! be handed to a `<video>` element, so every Drive link is rewritten into that
//! shape before it is stored and again before it is served.

use std::borrow::Cow;

use percent_encoding::percent_decode_str;
use url::{Url, form_urlencoded};

pub const DRIVE_HOST: &str = "drive.google.com";
const DIRECT_DOWNLOAD_PATH: &str = "/uc";
const FILE_VIEW_PREFIX: &str = "/file/d/";

/// Rewrites a Google Drive share link into its direct-download form.
///
/// Anything that is not a Drive URL, or a Drive URL without a recognisable
/// file id (folders, for instance), is returned untouched. The function is
/// idempotent: feeding its output back in yields the same string.
pub fn normalize_drive_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_owned();
    };
    if parsed.host_str() != Some(DRIVE_HOST) {
        return url.to_owned();
    }

    let id_param = query_value(&parsed, "id");

    if parsed.path() == DIRECT_DOWNLOAD_PATH
        && let Some(id) = id_param.as_deref()
        && query_value(&parsed, "export").as_deref() == Some("download")
    {
        return canonical_download_url(id);
    }

    if let Some(id) = file_view_id(parsed.path()) {
        return canonical_download_url(&id);
    }

    match id_param {
        Some(id) => canonical_download_url(&id),
        None => url.to_owned(),
    }
}

/// `https://drive.google.com/uc?export=download&id=<id>`
pub fn canonical_download_url(id: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(id.as_bytes()).collect();
    format!("https://{DRIVE_HOST}{DIRECT_DOWNLOAD_PATH}?export=download&id={encoded}")
}

/// First non-empty value of a query parameter.
fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(name, value)| name == key && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// Extracts the percent-decoded `<id>` from `/file/d/<id>` or `/file/d/<id>/...`.
fn file_view_id(path: &str) -> Option<Cow<'_, str>> {
    let rest = path.strip_prefix(FILE_VIEW_PREFIX)?;
    let id = rest.split('/').next().filter(|id| !id.is_empty())?;
    Some(
        percent_decode_str(id)
            .decode_utf8()
            .unwrap_or(Cow::Borrowed(id)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "https://drive.google.com/uc?export=download&id=ABC123";

    #[test]
    fn file_view_links_become_direct_downloads() {
        for input in [
            "https://drive.google.com/file/d/ABC123/view",
            "https://drive.google.com/file/d/ABC123/view?usp=sharing",
            "https://drive.google.com/file/d/ABC123/preview",
            "https://drive.google.com/file/d/ABC123",
        ] {
            assert_eq!(normalize_drive_url(input), CANONICAL, "input: {input}");
        }
    }

    #[test]
    fn open_links_use_the_id_parameter() {
        assert_eq!(
            normalize_drive_url("https://drive.google.com/open?id=ABC123"),
            CANONICAL
        );
    }

    #[test]
    fn direct_download_parameter_order_is_canonicalised() {
        assert_eq!(
            normalize_drive_url("https://drive.google.com/uc?id=ABC123&export=download"),
            CANONICAL
        );
    }

    #[test]
    fn uc_without_export_still_uses_the_id() {
        assert_eq!(
            normalize_drive_url("https://drive.google.com/uc?id=ABC123"),
            CANONICAL
        );
    }

    #[test]
    fn unrelated_urls_pass_through() {
        for input in [
            "https://example.com/file/d/ABC123/view",
            "https://drive.movieway.site/GD01/movie.mp4",
            "/GD01/MOVIE/Spider%20Man%201.mp4",
            "not a url at all",
            "",
        ] {
            assert_eq!(normalize_drive_url(input), input);
        }
    }

    #[test]
    fn encoded_file_view_ids_match_the_query_form() {
        let from_path = normalize_drive_url("https://drive.google.com/file/d/a%20b/view");
        let from_query = normalize_drive_url("https://drive.google.com/open?id=a%20b");
        assert_eq!(from_path, from_query);
        assert!(!from_path.contains("%25"), "double encoded: {from_path}");
        assert_eq!(normalize_drive_url(&from_path), from_path);
    }

    #[test]
    fn folder_links_are_left_alone() {
        let folder = "https://drive.google.com/drive/folders/XYZ789";
        assert_eq!(normalize_drive_url(folder), folder);
    }

    #[test]
    fn normalisation_is_idempotent() {
        for input in [
            "https://drive.google.com/file/d/ABC123/view",
            "https://drive.google.com/open?id=ABC123",
            "https://drive.google.com/uc?id=ABC123&export=download",
            "https://drive.google.com/drive/folders/XYZ789",
            "https://drive.google.com/open?id=a%26b%3Dc",
            "https://example.com/x",
            "garbage",
        ] {
            let once = normalize_drive_url(input);
            assert_eq!(normalize_drive_url(&once), once, "input: {input}");
        }
    }

    #[test]
    fn reserved_characters_in_ids_survive_a_round_trip() {
        let once = normalize_drive_url("https://drive.google.com/open?id=a%26b");
        assert_eq!(once, "https://drive.google.com/uc?export=download&id=a%26b");
    }
}
