//! Read- and write-time link rewriting for whole catalog records.
//!
//! Writes normalise Google Drive links before they hit the store. Reads
//! normalise again, which repairs records stored before normalisation
//! existed, and then resolve every link through Alist so the client receives
//! URLs it can play right away.

use futures::future::join_all;

use crate::alist::{AlistResolver, Resolution};
use crate::catalog::{ContentItem, ContentPayload, Episode, Season};
use crate::links::normalize_drive_url;

/// A record whose links were all resolved, plus how many of them degraded.
#[derive(Debug, Clone, PartialEq)]
pub struct Enriched {
    pub item: ContentItem,
    pub degraded: usize,
}

/// Applies Drive normalisation to an incoming payload.
pub fn normalize_for_storage(mut payload: ContentPayload) -> ContentPayload {
    payload.drive_link = normalize_optional(payload.drive_link);
    normalize_seasons(&mut payload.seasons);
    payload
}

/// Same rules as [`normalize_for_storage`], applied to a stored record. Empty
/// `driveLink` values are dropped.
pub fn normalize_for_response(mut item: ContentItem) -> ContentItem {
    item.drive_link = normalize_optional(item.drive_link);
    normalize_seasons(&mut item.seasons);
    item
}

fn normalize_optional(link: Option<String>) -> Option<String> {
    link.filter(|link| !link.is_empty())
        .map(|link| normalize_drive_url(&link))
}

fn normalize_seasons(seasons: &mut Option<Vec<Season>>) {
    for episode in episodes_mut(seasons) {
        if !episode.link.is_empty() {
            episode.link = normalize_drive_url(&episode.link);
        }
    }
}

fn episodes_mut(seasons: &mut Option<Vec<Season>>) -> impl Iterator<Item = &mut Episode> {
    seasons
        .iter_mut()
        .flatten()
        .flat_map(|season| season.episodes.iter_mut())
}

/// Resolves `driveLink`, `thumbnail` and every episode link concurrently.
///
/// Each resolution writes only its own field, so completion order does not
/// matter. Resolution never fails; degraded outcomes keep the best-known link
/// and are counted in [`Enriched::degraded`].
pub async fn enrich(resolver: &AlistResolver, mut item: ContentItem) -> Enriched {
    let ContentItem {
        drive_link,
        thumbnail,
        seasons,
        ..
    } = &mut item;

    let (drive, thumb, episodes) = tokio::join!(
        resolve_slot(resolver, drive_link),
        resolve_slot(resolver, thumbnail),
        join_all(
            episodes_mut(seasons).map(|episode| resolve_episode(resolver, episode))
        ),
    );

    let degraded = [drive, thumb]
        .into_iter()
        .chain(episodes)
        .flatten()
        .filter(Resolution::is_degraded)
        .count();

    Enriched { item, degraded }
}

/// Enriches a list of records, all of them concurrently.
pub async fn enrich_all(resolver: &AlistResolver, items: Vec<ContentItem>) -> Vec<Enriched> {
    join_all(items.into_iter().map(|item| enrich(resolver, item))).await
}

/// Normalises then enriches, the full read path for one record.
pub async fn prepare_for_response(resolver: &AlistResolver, item: ContentItem) -> Enriched {
    enrich(resolver, normalize_for_response(item)).await
}

async fn resolve_slot(resolver: &AlistResolver, slot: &mut Option<String>) -> Option<Resolution> {
    let link = slot.as_deref().filter(|link| !link.is_empty())?;
    let resolution = resolver.resolve(link).await;
    *slot = Some(resolution.link().to_owned());
    Some(resolution)
}

async fn resolve_episode(resolver: &AlistResolver, episode: &mut Episode) -> Option<Resolution> {
    if episode.link.is_empty() {
        return None;
    }
    let resolution = resolver.resolve(&episode.link).await;
    episode.link = resolution.link().to_owned();
    Some(resolution)
}
