//! Pairing of the fragments of two structurally comparable datacubes.

use crate::error::CubeError;
use crate::models::{CubeLayout, Datacube, DbmsId};

/// Indices into the `fragments` of two layouts that hold the same rows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentPair {
    pub a: usize,
    pub b: usize,
}

/// Check that two datacubes can be combined fragment by fragment.
pub fn check_comparable(a: &Datacube, b: &Datacube) -> Result<(), CubeError> {
    if a.fragment_ids.count() != b.fragment_ids.count() {
        return Err(CubeError::Comparison(format!(
            "fragment counts differ ({} and {})",
            a.fragment_ids.count(),
            b.fragment_ids.count()
        )));
    }
    if !a.fragment_ids.iter().eq(b.fragment_ids.iter()) {
        return Err(CubeError::Comparison(format!(
            "fragment ids differ ({} and {})",
            a.fragment_ids, b.fragment_ids
        )));
    }
    if a.measure_type != b.measure_type {
        return Err(CubeError::Comparison(format!(
            "measure types differ ({} and {})",
            a.measure_type, b.measure_type
        )));
    }
    if a.compressed != b.compressed {
        return Err(CubeError::Comparison(
            "only one datacube is compressed".to_string(),
        ));
    }
    if a.array_length() != b.array_length() {
        return Err(CubeError::Comparison(format!(
            "implicit dimension sizes differ ({} and {})",
            a.array_length(),
            b.array_length()
        )));
    }
    Ok(())
}

/// Pair every fragment of `a` with the fragment of `b` holding the same relative index.
///
/// When both layouts list the same DBMS at the same position, their databases and fragments are
/// paired positionally and must agree. Otherwise the counterpart DBMS and databases in `b` are
/// found by the relative index of their first fragment.
pub fn match_fragments(a: &CubeLayout, b: &CubeLayout) -> Result<Vec<FragmentPair>, CubeError> {
    let mut pairs = Vec::with_capacity(a.fragments.len());
    for (position, dbms) in a.dbms.iter().enumerate() {
        let same_host = b
            .dbms
            .get(position)
            .map_or(false, |other| other.id == dbms.id);
        if same_host {
            match_same_host(a, b, dbms.id, &mut pairs)?;
        } else {
            match_cross_host(a, b, dbms.id, &mut pairs)?;
        }
    }
    if pairs.len() != a.fragments.len() || pairs.len() != b.fragments.len() {
        return Err(CubeError::Comparison(format!(
            "matched {} fragment pairs out of {} and {} fragments",
            pairs.len(),
            a.fragments.len(),
            b.fragments.len()
        )));
    }
    Ok(pairs)
}

fn mismatch(what: &str) -> CubeError {
    CubeError::Comparison(format!("fragment layouts differ: {what}"))
}

fn match_same_host(
    a: &CubeLayout,
    b: &CubeLayout,
    dbms_id: DbmsId,
    pairs: &mut Vec<FragmentPair>,
) -> Result<(), CubeError> {
    let dbs_a: Vec<_> = a.dbs_of(dbms_id).collect();
    let dbs_b: Vec<_> = b.dbs_of(dbms_id).collect();
    if dbs_a.len() != dbs_b.len() {
        return Err(mismatch("database counts differ"));
    }
    for (db_a, db_b) in dbs_a.iter().zip(&dbs_b) {
        let fragments_a = a.fragments_of(db_a.id);
        let fragments_b = b.fragments_of(db_b.id);
        if fragments_a.len() != fragments_b.len() {
            return Err(mismatch("fragment counts per database differ"));
        }
        for (&i, &j) in fragments_a.iter().zip(&fragments_b) {
            if a.fragments[i].relative_index != b.fragments[j].relative_index {
                return Err(mismatch("relative indices differ"));
            }
            pairs.push(FragmentPair { a: i, b: j });
        }
    }
    Ok(())
}

fn match_cross_host(
    a: &CubeLayout,
    b: &CubeLayout,
    dbms_id: DbmsId,
    pairs: &mut Vec<FragmentPair>,
) -> Result<(), CubeError> {
    let Some(first) = a.first_fragment_of_dbms(dbms_id) else {
        return Ok(());
    };
    let first_index = a.fragments[first].relative_index;
    let other = b
        .dbms
        .iter()
        .find(|other| {
            b.first_fragment_of_dbms(other.id)
                .map(|j| b.fragments[j].relative_index)
                == Some(first_index)
        })
        .ok_or_else(|| mismatch("no DBMS holds the counterpart fragments"))?;

    for db_a in a.dbs_of(dbms_id) {
        let fragments_a = a.fragments_of(db_a.id);
        let Some(&first_a) = fragments_a.first() else {
            continue;
        };
        let first_index = a.fragments[first_a].relative_index;
        let db_b = b
            .dbs_of(other.id)
            .find(|db| {
                b.fragments_of(db.id)
                    .first()
                    .map(|&j| b.fragments[j].relative_index)
                    == Some(first_index)
            })
            .ok_or_else(|| mismatch("no database holds the counterpart fragments"))?;
        let fragments_b = b.fragments_of(db_b.id);
        for i in fragments_a {
            let j = fragments_b
                .iter()
                .copied()
                .find(|&j| b.fragments[j].relative_index == a.fragments[i].relative_index)
                .ok_or_else(|| mismatch("a fragment has no counterpart"))?;
            pairs.push(FragmentPair { a: i, b: j });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fragment_ids::FragmentIds;
    use crate::models::{DType, DbInstance, DbmsInstance, Dimension, FragmentRef};

    /// Layout with the given DBMS ids; each DBMS holds one database per entry of `dbs`, and each
    /// database holds the listed relative indices.
    fn layout(placements: &[(u64, &[&[u64]])], id_base: u64) -> CubeLayout {
        let mut layout = CubeLayout::default();
        let mut next_id = id_base;
        for (dbms_id, dbs) in placements {
            layout.dbms.push(DbmsInstance {
                id: *dbms_id,
                host: format!("host{dbms_id}"),
                port: 0,
            });
            for fragments in dbs.iter() {
                next_id += 1;
                let db_id = next_id;
                layout.dbs.push(DbInstance {
                    id: db_id,
                    dbms_id: *dbms_id,
                    name: format!("db{db_id}"),
                    owner: None,
                });
                for relative_index in fragments.iter() {
                    next_id += 1;
                    layout.fragments.push(FragmentRef {
                        id: next_id,
                        datacube_id: id_base,
                        relative_index: *relative_index,
                        db_instance_id: db_id,
                        key_start: 1,
                        key_end: 1,
                        name: format!("f{next_id}"),
                    });
                }
            }
        }
        layout
    }

    fn relative_pairs(a: &CubeLayout, b: &CubeLayout, pairs: &[FragmentPair]) -> Vec<(u64, u64)> {
        pairs
            .iter()
            .map(|p| (a.fragments[p.a].relative_index, b.fragments[p.b].relative_index))
            .collect()
    }

    #[test]
    fn same_host_positional() {
        let a = layout(&[(1, &[&[1, 2], &[3]]), (2, &[&[4]])], 100);
        let b = layout(&[(1, &[&[1, 2], &[3]]), (2, &[&[4]])], 200);
        let pairs = match_fragments(&a, &b).unwrap();
        assert_eq!(
            vec![(1, 1), (2, 2), (3, 3), (4, 4)],
            relative_pairs(&a, &b, &pairs)
        );
    }

    #[test]
    fn cross_host_by_first_fragment() {
        let a = layout(&[(1, &[&[1, 2]]), (2, &[&[3, 4]])], 100);
        let b = layout(&[(3, &[&[3, 4]]), (4, &[&[1, 2]])], 200);
        let pairs = match_fragments(&a, &b).unwrap();
        assert_eq!(
            vec![(1, 1), (2, 2), (3, 3), (4, 4)],
            relative_pairs(&a, &b, &pairs)
        );
        assert_eq!(b.fragments[pairs[0].b].db_instance_id, b.dbs[1].id);
    }

    #[test]
    fn same_host_relative_index_mismatch() {
        let a = layout(&[(1, &[&[1, 2]])], 100);
        let b = layout(&[(1, &[&[2, 1]])], 200);
        assert!(matches!(
            match_fragments(&a, &b),
            Err(CubeError::Comparison(_))
        ));
    }

    #[test]
    fn cross_host_without_counterpart() {
        let a = layout(&[(1, &[&[1, 2]])], 100);
        let b = layout(&[(2, &[&[1], &[3]])], 200);
        assert!(matches!(
            match_fragments(&a, &b),
            Err(CubeError::Comparison(_))
        ));
    }

    #[test]
    fn unequal_fragment_counts() {
        let a = layout(&[(1, &[&[1, 2]])], 100);
        let b = layout(&[(1, &[&[1, 2]]), (2, &[&[3]])], 200);
        assert!(matches!(
            match_fragments(&a, &b),
            Err(CubeError::Comparison(_))
        ));
    }

    fn cube(fragments: u64, measure_type: DType, compressed: bool, array_length: u64) -> Datacube {
        Datacube {
            id: 1,
            container_id: 1,
            measure: "temperature".to_string(),
            measure_type,
            fragment_ids: FragmentIds::build(1, 1, fragments),
            tuples_per_fragment: 1,
            rows: fragments,
            compressed,
            dimensions: vec![
                Dimension::indexed("lat", fragments, true),
                Dimension::indexed("time", array_length, false),
            ],
            size_bytes: None,
            description: None,
        }
    }

    #[test]
    fn comparable_cubes() {
        let a = cube(4, DType::Double, false, 12);
        assert!(check_comparable(&a, &cube(4, DType::Double, false, 12)).is_ok());
        for b in [
            cube(5, DType::Double, false, 12),
            cube(4, DType::Float, false, 12),
            cube(4, DType::Double, true, 12),
            cube(4, DType::Double, false, 6),
        ] {
            assert!(matches!(
                check_comparable(&a, &b),
                Err(CubeError::Comparison(_))
            ));
        }
    }
}
