//! Mappers feeding the user join: activity summaries on the left, profiles
//! on the right.

use anyhow::Result;
use bytes::{BufMut, BytesMut};

use crate::codec::{self, FIELD_SEPARATOR};
use crate::error::RecordFormatError;
use crate::ordering::COMPOSITE_SEPARATOR;
use crate::standalone::join::JOIN_STATS;
use crate::transform::{Lines, TaskContext};

/// `user<TAB>activity`, as written by the aggregation job.
pub fn activity_map(input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
    for line in input {
        match codec::decode(&line) {
            Ok(kv) => ctx.emit_record(kv),
            Err(err) => ctx.reject(JOIN_STATS, "malformed_activity", &line, err),
        }
    }
    Ok(())
}

/// `user,name,...[<TAB>more]`. The key is the text before the first comma;
/// the value is everything after it.
pub fn profile_map(input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
    for line in input {
        let head_end = line
            .iter()
            .position(|&b| b == FIELD_SEPARATOR)
            .unwrap_or(line.len());
        let head = line.slice(..head_end);
        let Some(comma) = head.iter().position(|&b| b == COMPOSITE_SEPARATOR) else {
            let cause = RecordFormatError::TooFewFields {
                expected: 2,
                found: 1,
            };
            ctx.reject(JOIN_STATS, "malformed_profile", &line, cause);
            continue;
        };
        if comma == 0 {
            ctx.reject(JOIN_STATS, "malformed_profile", &line, "empty user id");
            continue;
        }

        let mut value = BytesMut::with_capacity(line.len() - comma);
        value.put_slice(&head[comma + 1..]);
        value.put_slice(&line[head_end..]);
        ctx.emit(head.slice(..comma), value.freeze());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::standalone::JobEnv;
    use crate::transform::StreamFn;
    use crate::{Counters, KeyValue};

    fn run(f: StreamFn, lines: &[&'static str]) -> (Vec<KeyValue>, Counters) {
        let env = JobEnv::new();
        let counters = Counters::new();
        let mut ctx = TaskContext::new(&env, &counters);
        let input = lines.iter().map(|l| Bytes::from_static(l.as_bytes()));
        f(Box::new(input), &mut ctx).unwrap();
        (ctx.into_parts().0, counters)
    }

    #[test]
    fn profile_key_is_the_first_comma_field() {
        let (out, _) = run(profile_map, &["u1,Alice,NYC", "u2,Bob\tjoined:2020"]);
        assert_eq!(out[0], KeyValue::new(Bytes::from("u1"), Bytes::from("Alice,NYC")));
        assert_eq!(
            out[1],
            KeyValue::new(Bytes::from("u2"), Bytes::from("Bob\tjoined:2020"))
        );
    }

    #[test]
    fn profile_without_comma_is_rejected() {
        let (out, counters) = run(profile_map, &["u3", ",nobody"]);
        assert!(out.is_empty());
        assert_eq!(counters.get(JOIN_STATS, "malformed_profile"), 2);
    }

    #[test]
    fn activity_splits_once() {
        let (out, counters) = run(
            activity_map,
            &["u1\tposts:3,likes:5,comments:0,shares:1", "junk"],
        );
        assert_eq!(
            out,
            vec![KeyValue::new(
                Bytes::from("u1"),
                Bytes::from("posts:3,likes:5,comments:0,shares:1")
            )]
        );
        assert_eq!(counters.get(JOIN_STATS, "malformed_activity"), 1);
    }
}
