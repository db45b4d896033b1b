//! Small string helpers shared across crates

/// Turn free text into an object id candidate.
///
/// `"Living Room Temp"` becomes `living_room_temp`. Text with nothing
/// sluggable in it becomes `unknown`.
pub fn slugify(text: &str) -> String {
    let slug = slug::slugify(text).replace('-', "_");
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}
