//! Request classification.
//!
//! A pure function of request metadata: method, origin and URL. First match wins.

use reqwest::Method;
use url::Url;

use super::partition::PartitionKind;
use crate::net::{is_remote_host, Request};

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted: goes to the network untouched and is never stored.
  Bypass,
  /// Static shell resource, cache-first.
  Shell,
  /// Image, stale-while-revalidate.
  Image,
  /// Remote-data API call, stale-while-revalidate.
  RemoteData,
}

impl Route {
  pub fn partition(self) -> Option<PartitionKind> {
    match self {
      Self::Bypass => None,
      Self::Shell => Some(PartitionKind::AppShell),
      Self::Image => Some(PartitionKind::ImageCache),
      Self::RemoteData => Some(PartitionKind::AppData),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  remote_hosts: Vec<String>,
  api_markers: Vec<String>,
  storage_markers: Vec<String>,
  image_extensions: Vec<String>,
}

impl Classifier {
  pub fn new(
    origin: Url,
    remote_hosts: Vec<String>,
    api_markers: Vec<String>,
    storage_markers: Vec<String>,
    image_extensions: Vec<String>,
  ) -> Self {
    Self {
      origin,
      remote_hosts,
      api_markers,
      storage_markers,
      image_extensions,
    }
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::GET {
      return Route::Bypass;
    }

    let same_origin = request.url.origin() == self.origin.origin();
    if !same_origin && !is_remote_host(&self.remote_hosts, &request.url) {
      return Route::Bypass;
    }

    let url = request.url.as_str();
    if self.has_image_extension(request.url.path())
      || self.storage_markers.iter().any(|m| url.contains(m.as_str()))
    {
      return Route::Image;
    }

    if self.api_markers.iter().any(|m| url.contains(m.as_str())) {
      return Route::RemoteData;
    }

    Route::Shell
  }

  fn has_image_extension(&self, path: &str) -> bool {
    path
      .rsplit('/')
      .next()
      .and_then(|segment| segment.rsplit_once('.'))
      .is_some_and(|(_, ext)| {
        self
          .image_extensions
          .iter()
          .any(|known| known.eq_ignore_ascii_case(ext))
      })
  }
}
