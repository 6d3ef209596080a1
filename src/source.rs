// Readers for the listing spreadsheet (CSV export or .xlsx) and ad hoc JSON exports.
// Whatever the format, each row ends up as a map of header -> JSON value, and
// `row_from_fields` resolves header aliases and coerces the values into a `SourceRow`.
// Row order is preserved, since the import checkpoint is an offset into it.

use crate::{
    error::{Error, Result},
    models::{Checkpoint, MachineCount, SourceRow},
    util::{parse_float, reduce_whitespace},
};
use calamine::{Data, Reader, open_workbook_auto};
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Name,
    Address,
    City,
    State,
    Zip,
    Phone,
    Website,
    Rating,
    ReviewCount,
    Gps,
    Latitude,
    Longitude,
    Services,
    Hours,
    MachineCount,
}

const ALIASES: &[(Field, &[&str])] = &[
    (Field::Name, &["name", "title", "business_name"]),
    (
        Field::Address,
        &["address", "street", "street_address", "full_address"],
    ),
    (Field::City, &["city", "town"]),
    (Field::State, &["state", "province", "region"]),
    (Field::Zip, &["zip", "zipcode", "zip_code", "postal_code", "postalcode"]),
    (Field::Phone, &["phone", "phone_number", "telephone"]),
    (Field::Website, &["website", "site", "url", "web"]),
    (Field::Rating, &["rating", "totalscore", "total_score", "stars"]),
    (
        Field::ReviewCount,
        &[
            "review_count",
            "reviews",
            "reviews_count",
            "reviewscount",
            "user_ratings_total",
        ],
    ),
    (
        Field::Gps,
        &["gps", "coordinates", "gps_coordinates", "latlng", "location"],
    ),
    (Field::Latitude, &["latitude", "lat"]),
    (Field::Longitude, &["longitude", "lng", "lon", "long"]),
    (
        Field::Services,
        &["services", "services_offered", "categories", "amenities"],
    ),
    (
        Field::Hours,
        &["hours", "opening_hours", "hours_of_operation", "working_hours"],
    ),
    (Field::MachineCount, &["machine_count", "machines"]),
];

lazy_static! {
    static ref FIELDS: HashMap<&'static str, Field> = ALIASES
        .iter()
        .flat_map(|(f, names)| names.iter().map(move |n| (*n, *f)))
        .collect();
}

/// "Review Count" -> "review_count", "totalScore" -> "totalscore"
fn normalize_header(h: &str) -> String {
    reduce_whitespace(h)
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

fn text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => reduce_whitespace(s),
        Value::Number(n) => match n.as_f64() {
            // spreadsheets hand us zip codes and phone numbers as floats
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Array(a) => a
            .iter()
            .filter_map(text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null | Value::Object(_) => return None,
    };
    if s.is_empty() { None } else { Some(s) }
}

fn float(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_float(s),
        _ => None,
    }
}

fn integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

/// Build a row from header/value pairs. Unknown headers are ignored; when several aliases of
/// the same field are present, the first non-empty one wins.
pub fn row_from_fields<I, K>(fields: I) -> SourceRow
where
    I: IntoIterator<Item = (K, Value)>,
    K: AsRef<str>,
{
    let mut row = SourceRow::default();
    for (k, v) in fields {
        let Some(field) = FIELDS.get(normalize_header(k.as_ref()).as_str()) else {
            continue;
        };
        match field {
            Field::Name => row.name = row.name.or_else(|| text(&v)),
            Field::Address => row.address = row.address.or_else(|| text(&v)),
            Field::City => row.city = row.city.or_else(|| text(&v)),
            Field::State => row.state = row.state.or_else(|| text(&v)),
            Field::Zip => row.zip = row.zip.or_else(|| text(&v)),
            Field::Phone => row.phone = row.phone.or_else(|| text(&v)),
            Field::Website => row.website = row.website.or_else(|| text(&v)),
            Field::Rating => row.rating = row.rating.or_else(|| float(&v)),
            Field::ReviewCount => row.review_count = row.review_count.or_else(|| integer(&v)),
            Field::Latitude => row.latitude = row.latitude.or_else(|| float(&v)),
            Field::Longitude => row.longitude = row.longitude.or_else(|| float(&v)),
            Field::Services => row.services = row.services.or_else(|| text(&v)),
            Field::Gps => match &v {
                Value::Object(o) => {
                    row.latitude = row.latitude.or_else(|| o.get("lat").and_then(float));
                    row.longitude = row
                        .longitude
                        .or_else(|| o.get("lng").or_else(|| o.get("lon")).and_then(float));
                }
                Value::Array(a) if a.len() == 2 => {
                    row.latitude = row.latitude.or_else(|| float(&a[0]));
                    row.longitude = row.longitude.or_else(|| float(&a[1]));
                }
                _ => row.gps = row.gps.or_else(|| text(&v)),
            },
            Field::Hours => {
                if row.hours.is_none() && (v.is_object() || text(&v).is_some()) {
                    row.hours = Some(v);
                }
            }
            Field::MachineCount => {
                if row.machine_count.is_none() {
                    row.machine_count = serde_json::from_value::<MachineCount>(v).ok();
                }
            }
        }
    }
    row
}

fn cell_value(c: &Data) -> Value {
    match c {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => Value::from(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Vec<SourceRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = rdr.headers()?.clone();
    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        rows.push(row_from_fields(
            headers
                .iter()
                .zip(rec.iter())
                .map(|(h, v)| (h, Value::String(v.to_string()))),
        ));
    }
    Ok(rows)
}

/// First sheet of the workbook, first row is the header
pub fn read_xlsx<P: AsRef<Path>>(path: P) -> Result<Vec<SourceRow>> {
    let mut wb = open_workbook_auto(path)?;
    let sheet = wb
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| Error::InvalidSource("workbook has no sheets".into()))?;
    let range = wb.worksheet_range(&sheet)?;
    let mut it = range.rows();
    let headers: Vec<String> = match it.next() {
        Some(h) => h.iter().map(|c| c.to_string()).collect(),
        None => return Ok(Vec::new()),
    };
    debug!(sheet, columns = headers.len(), "Reading workbook");
    Ok(it
        .map(|r| {
            row_from_fields(
                headers
                    .iter()
                    .zip(r.iter())
                    .map(|(h, c)| (h.as_str(), cell_value(c))),
            )
        })
        .collect())
}

fn json_records(v: Value) -> Result<Vec<Value>> {
    match v {
        Value::Array(a) => Ok(a),
        Value::Object(mut o) => {
            for key in ["data", "rows", "results", "laundromats", "items"] {
                if let Some(Value::Array(a)) = o.remove(key) {
                    return Ok(a);
                }
            }
            Err(Error::InvalidSource(
                "json object without a top level array of records".into(),
            ))
        }
        _ => Err(Error::InvalidSource("json source must be an array".into())),
    }
}

/// A JSON array of objects, or an object wrapping one. Elements that are not objects become
/// empty rows, so that offsets keep matching the file.
pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Vec<SourceRow>> {
    let v: Value = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    Ok(json_records(v)?
        .into_iter()
        .enumerate()
        .map(|(i, r)| match r {
            Value::Object(o) => row_from_fields(o),
            _ => {
                warn!(index = i, "Skipping json record that is not an object");
                row_from_fields(Map::new())
            }
        })
        .collect())
}

/// Pick a reader from the file extension
pub fn read_rows<P: AsRef<Path>>(path: P) -> Result<Vec<SourceRow>> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("csv") => read_csv(path),
        Some("xlsx" | "xlsm" | "xls" | "ods") => read_xlsx(path),
        Some("json") => read_json(path),
        _ => Err(Error::UnsupportedSource(PathBuf::from(path))),
    }
}

/// Progress file written by the old per-script importers
#[derive(Debug, Deserialize)]
struct LegacyCursor {
    #[serde(alias = "lastProcessedId", alias = "offset", alias = "lastIndex")]
    position: i64,
    #[serde(default, alias = "totalImported", alias = "totalProcessed")]
    total_processed: i64,
}

/// Turn an old cursor file into a checkpoint for `job`
pub fn read_legacy_cursor<P: AsRef<Path>>(path: P, job: &str) -> Result<Checkpoint> {
    let c: LegacyCursor = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    Ok(Checkpoint {
        position: c.position.max(0),
        total_processed: c.total_processed.max(0),
        ..Checkpoint::new(job)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn headers() {
        assert_eq!("review_count", normalize_header(" Review  Count "));
        assert_eq!("totalscore", normalize_header("totalScore"));
        assert_eq!("zip_code", normalize_header("Zip-Code"));
    }

    #[test]
    fn fields_are_coerced() {
        let row = row_from_fields([
            ("Title", json!("Suds")),
            ("Name", json!("Ignored, title came first")),
            ("Postal Code", json!(78701.0)),
            ("Reviews", json!("1,204")),
            ("totalScore", json!("4.7")),
            ("Categories", json!(["Laundromat", "Dry cleaner"])),
            ("location", json!({"lat": 30.1, "lng": -97.2})),
            ("Website", json!("")),
            ("unrelated", json!(1)),
        ]);
        assert_eq!(Some("Suds".into()), row.name);
        assert_eq!(Some("78701".into()), row.zip);
        assert_eq!(Some(1204), row.review_count);
        assert_eq!(Some(4.7), row.rating);
        assert_eq!(Some("Laundromat, Dry cleaner".into()), row.services);
        assert_eq!(Some(30.1), row.latitude);
        assert_eq!(Some(-97.2), row.longitude);
        assert_eq!(None, row.website);
    }

    #[test]
    fn csv_rows_keep_order() {
        let mut f = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(f, "Title,Address,City,State,Zip,Phone,Website,Rating,Reviews,GPS,Services").unwrap();
        writeln!(f, "A,1 Main,Austin,TX,78701,,,4.5,10,\"30.1,-97.1\",\"wifi, parking\"").unwrap();
        writeln!(f, "B,2 Main,,TX,78702,,,,,,").unwrap();
        writeln!(f, "C,3 Main,Dallas,Texas,75201,555-1234,https://c.example,3,2,,").unwrap();
        f.flush().unwrap();

        let rows = read_rows(f.path()).unwrap();
        assert_eq!(3, rows.len());
        assert_eq!(Some("A".into()), rows[0].name);
        assert_eq!(Some("30.1,-97.1".into()), rows[0].gps);
        assert_eq!(Some("wifi, parking".into()), rows[0].services);
        assert_eq!(None, rows[1].city);
        assert_eq!(None, rows[1].rating);
        assert_eq!(Some("https://c.example".into()), rows[2].website);
        assert_eq!(Some(2), rows[2].review_count);
    }

    #[test]
    fn json_wrapped_array() {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let doc = json!({
            "data": [
                {"name": "A", "city": "Austin", "state": "TX", "hours": {"Monday": "8-5"}},
                "garbage",
                {"name": "C", "machines": {"washers": 12, "dryers": 10}}
            ]
        });
        write!(f, "{doc}").unwrap();
        f.flush().unwrap();

        let rows = read_rows(f.path()).unwrap();
        assert_eq!(3, rows.len());
        assert_eq!(Some(json!({"Monday": "8-5"})), rows[0].hours);
        assert_eq!(SourceRow::default(), rows[1]);
        assert_eq!(Some(12), rows[2].machine_count.as_ref().unwrap().washers);
    }

    #[test]
    fn legacy_cursor_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import-progress.json");
        std::fs::write(&path, r#"{"lastProcessedId": 1200, "totalImported": 950, "x": 1}"#)
            .unwrap();
        let cp = read_legacy_cursor(&path, "import").unwrap();
        assert_eq!(("import", 1200, 950), (cp.job.as_str(), cp.position, cp.total_processed));

        std::fs::write(&path, r#"{"position": 40}"#).unwrap();
        assert_eq!(40, read_legacy_cursor(&path, "import").unwrap().position);

        std::fs::write(&path, r#"{"totalImported": 3}"#).unwrap();
        assert!(read_legacy_cursor(&path, "import").is_err());
    }

    #[test]
    fn unsupported_extension() {
        assert!(matches!(
            read_rows("listings.txt"),
            Err(Error::UnsupportedSource(_))
        ));
    }
}
