//! Shard layout and query construction for the OPDR local-union dataset.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "gazetteer-core";

/// Rows requested per page.
pub const PAGE_SIZE: u64 = 5000;

/// Number of pages that cover the dataset.
pub const SHARD_COUNT: usize = 7;

pub const MERGED_FILE_NAME: &str = "opdr_local.csv";

pub const DEFAULT_ENDPOINT: &str = "https://labordata.bunkum.us/opdr.csv";

/// Placeholder substituted with the shard offset.
pub const OFFSET_PLACEHOLDER: &str = "{offset}";

/// Latest filing per union, with the two name columns the matcher compares.
pub const DEFAULT_SQL_TEMPLATE: &str = "select
  lm_data.f_num,
  lm_data.aff_abbr,
  lm_data.desig_pre,
  lm_data.desig_name,
  lm_data.desig_num,
  lm_data.desig_suf,
  lm_data.unit_name,
  lm_data.city,
  lm_data.state,
  lm_data.receive_date,
  trim(
    lm_data.aff_abbr || ' ' || coalesce(lm_data.desig_name, '') || ' ' || coalesce(lm_data.desig_num, '') || coalesce(lm_data.desig_suf, '')
  ) as abbr_local_name,
  trim(
    coalesce(lm_data.unit_name, '') || ' ' || coalesce(lm_data.aff_abbr, '') || ' ' || coalesce(lm_data.desig_name, '') || ' ' || coalesce(lm_data.desig_num, '') || coalesce(lm_data.desig_suf, '')
  ) as full_local_name
from
  lm_data
  inner join (
    select f_num, max(receive_date) as receive_date from lm_data group by f_num
  ) as latest on latest.f_num = lm_data.f_num and latest.receive_date = lm_data.receive_date
order by
  lm_data.f_num
limit 5000 offset {offset}";

/// One paginated slice of the remote dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSpec {
    pub index: usize,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    #[error("shard index {index} out of range 0..{}", SHARD_COUNT)]
    IndexOutOfRange { index: usize },
}

impl ShardSpec {
    /// Offsets follow 0, 5001, 10001, ... so the second page onward starts one past the page boundary.
    pub fn new(index: usize) -> Result<Self, ShardError> {
        if index >= SHARD_COUNT {
            return Err(ShardError::IndexOutOfRange { index });
        }
        Ok(Self {
            index,
            offset: offset_for_index(index),
        })
    }

    pub fn all() -> Vec<ShardSpec> {
        (0..SHARD_COUNT)
            .map(|index| ShardSpec {
                index,
                offset: offset_for_index(index),
            })
            .collect()
    }

    pub fn file_name(&self) -> String {
        format!("opdr_local_{}.csv", self.index)
    }
}

fn offset_for_index(index: usize) -> u64 {
    let index = index as u64;
    index * PAGE_SIZE + u64::from(index > 0)
}

#[derive(Debug, Error)]
pub enum QueryConfigError {
    #[error("invalid endpoint {endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("endpoint {0} cannot carry query parameters")]
    NotABase(String),
    #[error("sql template must contain `{}` exactly once, found {found}", OFFSET_PLACEHOLDER)]
    Placeholder { found: usize },
}

/// Builds shard URLs against a SQL-over-HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuilder {
    endpoint: Url,
    template: String,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid url"),
            template: DEFAULT_SQL_TEMPLATE.to_string(),
        }
    }
}

impl QueryBuilder {
    pub fn new(endpoint: &str, template: impl Into<String>) -> Result<Self, QueryConfigError> {
        let parsed = Url::parse(endpoint).map_err(|source| QueryConfigError::Endpoint {
            endpoint: endpoint.to_string(),
            source,
        })?;
        if parsed.cannot_be_a_base() {
            return Err(QueryConfigError::NotABase(endpoint.to_string()));
        }

        let template = template.into();
        let found = template.matches(OFFSET_PLACEHOLDER).count();
        if found != 1 {
            return Err(QueryConfigError::Placeholder { found });
        }

        Ok(Self {
            endpoint: parsed,
            template,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn sql_for_offset(&self, offset: u64) -> String {
        self.template
            .replace(OFFSET_PLACEHOLDER, &offset.to_string())
    }

    /// Query pairs are form-encoded, so spaces in the SQL become `+`.
    pub fn build_url(&self, offset: u64) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("sql", &self.sql_for_offset(offset))
            .append_pair("_size", "max");
        url
    }

    pub fn shard_url(&self, shard: &ShardSpec) -> Url {
        self.build_url(shard.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPECTED_OFFSETS: [u64; SHARD_COUNT] = [0, 5001, 10001, 15001, 20001, 25001, 30001];

    fn decoded_sql(url: &Url) -> String {
        url.query_pairs()
            .find(|(k, _)| k == "sql")
            .map(|(_, v)| v.into_owned())
            .expect("sql param")
    }

    #[test]
    fn offset_table_matches_page_boundaries() {
        let offsets: Vec<u64> = ShardSpec::all().iter().map(|s| s.offset).collect();
        assert_eq!(offsets, EXPECTED_OFFSETS);
        for (index, spec) in ShardSpec::all().into_iter().enumerate() {
            assert_eq!(spec.index, index);
            assert_eq!(ShardSpec::new(index).unwrap(), spec);
        }
    }

    #[test]
    fn shard_index_past_table_is_rejected() {
        assert_eq!(
            ShardSpec::new(SHARD_COUNT),
            Err(ShardError::IndexOutOfRange { index: SHARD_COUNT })
        );
    }

    #[test]
    fn shard_file_names_follow_convention() {
        let names: Vec<String> = ShardSpec::all().iter().map(ShardSpec::file_name).collect();
        assert_eq!(names[0], "opdr_local_0.csv");
        assert_eq!(names[6], "opdr_local_6.csv");
    }

    #[test]
    fn each_url_carries_exactly_one_offset() {
        let builder = QueryBuilder::default();
        for offset in EXPECTED_OFFSETS {
            let url = builder.build_url(offset).to_string();
            let needle = format!("offset+{offset}&");
            assert_eq!(url.matches(&needle).count(), 1, "{url}");
            assert_eq!(url.matches("offset+").count(), 1, "{url}");
        }
    }

    #[test]
    fn decoded_sql_ends_with_pagination_clause() {
        let url = QueryBuilder::default().build_url(10001);
        assert!(decoded_sql(&url).ends_with("limit 5000 offset 10001"));
    }

    #[test]
    fn url_targets_endpoint_with_max_size() {
        let url = QueryBuilder::default().build_url(0);
        assert_eq!(url.host_str(), Some("labordata.bunkum.us"));
        assert_eq!(url.path(), "/opdr.csv");
        let size: Vec<_> = url.query_pairs().filter(|(k, _)| k == "_size").collect();
        assert_eq!(size.len(), 1);
        assert_eq!(size[0].1, "max");
        assert!(url.as_str().ends_with("&_size=max"));
    }

    #[test]
    fn sql_selects_computed_name_columns() {
        let sql = QueryBuilder::default().sql_for_offset(0);
        assert!(sql.contains("as abbr_local_name"));
        assert!(sql.contains("as full_local_name"));
    }

    #[test]
    fn build_is_deterministic_for_any_offset() {
        let builder = QueryBuilder::default();
        assert_eq!(builder.build_url(123_456), builder.build_url(123_456));
        assert!(decoded_sql(&builder.build_url(7)).ends_with("offset 7"));
    }

    #[test]
    fn custom_template_requires_single_placeholder() {
        let err = QueryBuilder::new("http://127.0.0.1:8001/db.csv", "select 1").unwrap_err();
        assert!(matches!(err, QueryConfigError::Placeholder { found: 0 }));

        let err = QueryBuilder::new(
            "http://127.0.0.1:8001/db.csv",
            "select {offset} limit 1 offset {offset}",
        )
        .unwrap_err();
        assert!(matches!(err, QueryConfigError::Placeholder { found: 2 }));

        let builder =
            QueryBuilder::new("http://127.0.0.1:8001/db.csv", "select * from t limit 5000 offset {offset}")
                .unwrap();
        assert_eq!(
            builder.build_url(5001).as_str(),
            "http://127.0.0.1:8001/db.csv?sql=select+*+from+t+limit+5000+offset+5001&_size=max"
        );
    }

    #[test]
    fn bad_endpoint_is_a_config_error() {
        assert!(matches!(
            QueryBuilder::new("not a url", "offset {offset}"),
            Err(QueryConfigError::Endpoint { .. })
        ));
        assert!(matches!(
            QueryBuilder::new("mailto:ops@example.org", "offset {offset}"),
            Err(QueryConfigError::NotABase(_))
        ));
    }
}
