//! Target import from CSV.
//!
//! Expected header: `type,ip,port,user,pass` (case-insensitive, any order).
//! Extra columns are ignored. Bad rows do not abort the import; they are
//! reported individually so the rest of the file still loads.

use credprobe_types::{Protocol, Target};

#[derive(Debug)]
pub struct Import {
    pub targets: Vec<Target>,
    /// One message per rejected row, tagged with its 1-based line number.
    pub errors: Vec<String>,
}

struct Columns {
    protocol: usize,
    host: usize,
    port: Option<usize>,
    user: Option<usize>,
    pass: Option<usize>,
}

fn parse_header(line: &str) -> Result<Columns, String> {
    let mut protocol = None;
    let mut host = None;
    let mut port = None;
    let mut user = None;
    let mut pass = None;
    for (i, name) in line.split(',').enumerate() {
        match name.trim().to_ascii_lowercase().as_str() {
            "type" | "protocol" => protocol = Some(i),
            "ip" | "host" => host = Some(i),
            "port" => port = Some(i),
            "user" | "username" => user = Some(i),
            "pass" | "password" => pass = Some(i),
            _ => {}
        }
    }
    match (protocol, host) {
        (Some(protocol), Some(host)) => Ok(Columns {
            protocol,
            host,
            port,
            user,
            pass,
        }),
        _ => Err("header must contain `type` and `ip` columns".to_string()),
    }
}

fn field<'a>(cells: &'a [&str], index: Option<usize>) -> Option<&'a str> {
    let cell = cells.get(index?)?.trim();
    if cell.is_empty() { None } else { Some(cell) }
}

fn parse_row(cells: &[&str], columns: &Columns) -> Result<Target, String> {
    let protocol: Protocol = cells
        .get(columns.protocol)
        .map(|c| c.trim())
        .unwrap_or("")
        .parse()
        .map_err(|e| format!("{e}"))?;
    let host = match field(cells, Some(columns.host)) {
        Some(host) => host.to_string(),
        None => return Err("missing host".to_string()),
    };
    let port = match field(cells, columns.port) {
        Some(cell) => cell
            .parse::<u16>()
            .map_err(|_| format!("invalid port: {cell}"))?,
        None => protocol.default_port(),
    };
    Ok(Target::new(protocol, host, port).with_credentials(
        field(cells, columns.user).map(str::to_string),
        field(cells, columns.pass).map(str::to_string),
    ))
}

pub fn parse(text: &str) -> Result<Import, String> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let (_, header) = lines.next().ok_or_else(|| "empty file".to_string())?;
    let columns = parse_header(header)?;

    let mut targets = Vec::new();
    let mut errors = Vec::new();
    for (index, line) in lines {
        let cells: Vec<&str> = line.split(',').collect();
        match parse_row(&cells, &columns) {
            Ok(target) => targets.push(target),
            Err(e) => errors.push(format!("line {}: {e}", index + 1)),
        }
    }
    Ok(Import { targets, errors })
}
