//! SQL helper functions referenced by compiled statements.
//!
//! Installed by `PostgresAdapter::perform_initialization`. Every definition
//! uses `CREATE OR REPLACE` so installation can be repeated.

use super::builder::Statement;

pub const ARRAY_ADD: &str = r#"CREATE OR REPLACE FUNCTION array_add("array" jsonb, "values" jsonb)
RETURNS jsonb
LANGUAGE sql
IMMUTABLE
AS $function$
  SELECT COALESCE("array", '[]'::jsonb) || COALESCE("values", '[]'::jsonb);
$function$;"#;

pub const ARRAY_ADD_UNIQUE: &str = r#"CREATE OR REPLACE FUNCTION array_add_unique("array" jsonb, "values" jsonb)
RETURNS jsonb
LANGUAGE sql
IMMUTABLE
AS $function$
  SELECT COALESCE(jsonb_agg(elt ORDER BY ord), '[]'::jsonb)
  FROM (
    SELECT DISTINCT ON (elt) elt, ord
    FROM (
      SELECT elt, ord FROM jsonb_array_elements(COALESCE("array", '[]'::jsonb)) WITH ORDINALITY AS a(elt, ord)
      UNION ALL
      SELECT elt, ord + jsonb_array_length(COALESCE("array", '[]'::jsonb))
      FROM jsonb_array_elements(COALESCE("values", '[]'::jsonb)) WITH ORDINALITY AS v(elt, ord)
    ) AS combined
    ORDER BY elt, ord
  ) AS unique_elements;
$function$;"#;

pub const ARRAY_REMOVE: &str = r#"CREATE OR REPLACE FUNCTION array_remove("array" jsonb, "values" jsonb)
RETURNS jsonb
LANGUAGE sql
IMMUTABLE
AS $function$
  SELECT COALESCE(jsonb_agg(elt ORDER BY ord), '[]'::jsonb)
  FROM jsonb_array_elements(COALESCE("array", '[]'::jsonb)) WITH ORDINALITY AS a(elt, ord)
  WHERE elt NOT IN (SELECT jsonb_array_elements(COALESCE("values", '[]'::jsonb)));
$function$;"#;

pub const ARRAY_CONTAINS: &str = r#"CREATE OR REPLACE FUNCTION array_contains("array" jsonb, "values" jsonb)
RETURNS boolean
LANGUAGE sql
IMMUTABLE
AS $function$
  SELECT EXISTS (
    SELECT 1 FROM jsonb_array_elements(COALESCE("array", '[]'::jsonb)) AS a(elt)
    WHERE elt IN (SELECT jsonb_array_elements(COALESCE("values", '[]'::jsonb)))
  );
$function$;"#;

pub const ARRAY_CONTAINS_ALL: &str = r#"CREATE OR REPLACE FUNCTION array_contains_all("array" jsonb, "values" jsonb)
RETURNS boolean
LANGUAGE sql
IMMUTABLE
AS $function$
  SELECT jsonb_array_length(COALESCE("values", '[]'::jsonb)) > 0 AND NOT EXISTS (
    SELECT 1 FROM jsonb_array_elements("values") AS v(elt)
    WHERE elt NOT IN (SELECT jsonb_array_elements(COALESCE("array", '[]'::jsonb)))
  );
$function$;"#;

pub const ARRAY_CONTAINS_ALL_REGEX: &str = r#"CREATE OR REPLACE FUNCTION array_contains_all_regex("array" jsonb, "values" jsonb)
RETURNS boolean
LANGUAGE sql
IMMUTABLE
AS $function$
  SELECT jsonb_array_length(COALESCE("values", '[]'::jsonb)) > 0 AND NOT EXISTS (
    SELECT 1 FROM jsonb_array_elements_text("values") AS v(pattern)
    WHERE NOT EXISTS (
      SELECT 1 FROM jsonb_array_elements_text(COALESCE("array", '[]'::jsonb)) AS a(elt)
      WHERE elt LIKE pattern
    )
  );
$function$;"#;

pub const JSON_OBJECT_SET_KEY: &str = r#"CREATE OR REPLACE FUNCTION json_object_set_key("json" jsonb, key_to_set text, value_to_set jsonb)
RETURNS jsonb
LANGUAGE sql
IMMUTABLE
AS $function$
  SELECT (COALESCE("json", '{}'::jsonb) - key_to_set)
    || CASE WHEN value_to_set IS NULL THEN '{}'::jsonb ELSE jsonb_build_object(key_to_set, value_to_set) END;
$function$;"#;

/// All helper functions, in installation order
pub fn helper_functions() -> Vec<(&'static str, Statement)> {
    [
        ("array_add", ARRAY_ADD),
        ("array_add_unique", ARRAY_ADD_UNIQUE),
        ("array_remove", ARRAY_REMOVE),
        ("array_contains", ARRAY_CONTAINS),
        ("array_contains_all", ARRAY_CONTAINS_ALL),
        ("array_contains_all_regex", ARRAY_CONTAINS_ALL_REGEX),
        ("json_object_set_key", JSON_OBJECT_SET_KEY),
    ]
    .into_iter()
    .map(|(name, sql)| (name, Statement::raw(sql)))
    .collect()
}
