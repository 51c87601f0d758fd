//! Virtual work-size mapper: factors a requested 1D-3D iteration space into
//! a grid that fits the device's hardware grid-axis limits while keeping
//! iteration order intact.
//!
//! Grounded on `original_source/tigger/cluda/vsize.py`'s `VirtualSizes`,
//! kept branch-for-branch faithful to its rearrangement recursion (see
//! `rearrange_1d` for the one deliberate deviation, SPEC_FULL.md §9 Open
//! Question 2). `smallvec` is the teacher's own dependency, used here for
//! the fixed-arity-at-most-3 axis vectors the algorithm works with.

use smallvec::{smallvec, SmallVec};
use tera::Context;

use crate::errors::{Result, ResultExt};

pub type Axes = SmallVec<[usize; 3]>;

#[derive(Clone, Debug)]
pub struct DeviceParams {
    pub max_work_group_size: usize,
    pub max_grid_sizes: Axes,
}

fn product(xs: &[usize]) -> usize {
    xs.iter().product()
}

fn min_blocks(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}

/// `(divisor, quotient)` pairs for every divisor of `n`, in ascending
/// divisor order. Only divisors up to `sqrt(n)` are discovered directly,
/// but each one's complement (`n / d`, `d`) is also a true divisor pair and
/// is included too, so the list covers every divisor of `n`, not only the
/// half that is `<= sqrt(n)`.
fn factors(n: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut complements = Vec::new();
    let mut d = 1;
    while d * d <= n {
        if n % d == 0 {
            out.push((d, n / d));
            if d != n / d {
                complements.push((n / d, d));
            }
        }
        d += 1;
    }
    out.extend(complements.into_iter().rev());
    out
}

/// `floor(log2(x))` for `x >= 1`.
fn log2(x: usize) -> u32 {
    (usize::BITS - 1) - x.leading_zeros()
}

/// The kernel's virtual launch geometry, rearranged to respect a device's
/// per-axis grid-size limits.
#[derive(Clone, Debug)]
pub struct VirtualSizeMapper {
    params: DeviceParams,
    global_size: Axes,
    local_size: Axes,
    grid_parts: Vec<Axes>,
    grid: Axes,
    k_local_size: Axes,
    k_global_size: Axes,
}

impl VirtualSizeMapper {
    pub fn new(params: DeviceParams, global_size: &[usize], local_size: &[usize]) -> Result<Self> {
        if global_size.len() != local_size.len() {
            return Err(crate::errors::ErrorKind::InvalidLaunchGeometry(
                "global and local work sizes have differing dimensions".into(),
            )
            .into());
        }
        if global_size.is_empty() || global_size.len() > 3 {
            return Err(crate::errors::ErrorKind::InvalidLaunchGeometry(
                "virtual sizes are supported for 1D to 3D grids only".into(),
            )
            .into());
        }

        let global_size: Axes = global_size.iter().copied().collect();
        let local_size: Axes = local_size.iter().copied().collect();

        let naive_bounding_grid: Axes =
            global_size.iter().zip(local_size.iter()).map(|(&gs, &ls)| min_blocks(gs, ls)).collect();

        if product(&local_size) > params.max_work_group_size {
            return Err(crate::errors::ErrorKind::InvalidLaunchGeometry(
                "number of work items per group is too high for this device".into(),
            )
            .into());
        }
        if product(&naive_bounding_grid) > product(&params.max_grid_sizes) {
            return Err(crate::errors::ErrorKind::InvalidLaunchGeometry(
                "number of work groups is too high for this device".into(),
            )
            .into());
        }

        let grid_parts = rearrange_grid(&naive_bounding_grid, &params.max_grid_sizes)?;
        let gdims = params.max_grid_sizes.len();
        let grid: Axes = (0..gdims).map(|i| product(&grid_parts.iter().map(|row| row[i]).collect::<Vec<_>>())).collect();

        let mut k_local_size: Axes = local_size.clone();
        while k_local_size.len() < gdims {
            k_local_size.push(1);
        }
        let k_global_size: Axes = k_local_size.iter().zip(grid.iter()).map(|(&l, &g)| l * g).collect();

        Ok(VirtualSizeMapper {
            params,
            global_size,
            local_size,
            grid_parts,
            grid,
            k_local_size,
            k_global_size,
        })
    }

    pub fn get_call_sizes(&self) -> (Axes, Axes) {
        (self.k_global_size.clone(), self.k_local_size.clone())
    }

    /// Renders the `virtual_*_id` kernel-side helper block for this launch
    /// geometry, via the sibling `vsize.c.tera` template — the Rust
    /// counterpart of `vsize.py` keeping its rendered text in a template
    /// file alongside the module rather than an inline string.
    ///
    /// The div/mod chain that reassembles each virtual dimension's id from
    /// the physical `get_group_id`/`get_local_id` calls is precomputed here
    /// in Rust rather than inside the template: it only needs to be
    /// *some* consistent, invertible unpacking of `grid_parts` (each
    /// physical axis's capacity is the product of every row's entry for
    /// that axis, assigned least-significant row first), not a literal
    /// port of a template we don't have a copy of.
    pub fn render_vsize_funcs(&self) -> Result<String> {
        let vdims = self.global_size.len();
        let gdims = self.params.max_grid_sizes.len();

        let local_id_exprs: Vec<String> = (0..vdims).map(|d| format!("get_local_id({})", d)).collect();
        let group_id_exprs: Vec<String> = (0..vdims).map(|d| self.group_id_expr(d, gdims)).collect();
        let global_id_exprs: Vec<String> = (0..vdims)
            .map(|d| format!("(({}) + ({}) * {})", local_id_exprs[d], group_id_exprs[d], self.k_local_size[d]))
            .collect();

        let mut flat_id_expr = global_id_exprs[0].clone();
        let mut stride = self.global_size[0];
        for d in 1..vdims {
            flat_id_expr = format!("({}) + ({}) * {}", flat_id_expr, global_id_exprs[d], stride);
            stride *= self.global_size[d];
        }
        let total_size = product(&self.global_size);

        let mut tera = tera::Tera::default();
        tera.add_raw_template("vsize.c.tera", include_str!("templates/vsize.c.tera"))
            .chain_err(|| "vsize helper template failed to parse")?;

        let mut ctx = Context::new();
        ctx.insert("vdims", &vdims);
        ctx.insert("local_id_exprs", &local_id_exprs);
        ctx.insert("group_id_exprs", &group_id_exprs);
        ctx.insert("global_id_exprs", &global_id_exprs);
        ctx.insert("flat_id_expr", &flat_id_expr);
        ctx.insert("total_size", &total_size);

        tera.render("vsize.c.tera", &ctx).chain_err(|| "vsize helper template failed to render")
    }

    /// The group-id expression for virtual dimension `d`: unpacks every
    /// physical axis's contribution to this virtual dimension (the rows
    /// before `d` are assumed to have already claimed the low-order chunk
    /// of any axis they share with `d`).
    fn group_id_expr(&self, d: usize, gdims: usize) -> String {
        let mut axis_stride = vec![1usize; gdims];
        for row in self.grid_parts.iter().take(d) {
            for i in 0..gdims {
                if row[i] > 1 {
                    axis_stride[i] *= row[i];
                }
            }
        }

        let mut terms = Vec::new();
        let mut multiplier = 1usize;
        for i in 0..gdims {
            let part = self.grid_parts[d][i];
            if part > 1 {
                let physical = if axis_stride[i] > 1 {
                    format!("get_group_id({}) / {}", i, axis_stride[i])
                } else {
                    format!("get_group_id({})", i)
                };
                terms.push(format!("(({}) % {}) * {}", physical, part, multiplier));
                multiplier *= part;
            }
        }

        if terms.is_empty() {
            "0".to_string()
        } else {
            terms.join(" + ")
        }
    }
}

fn rearrange_grid(grid: &[usize], max_grid: &[usize]) -> Result<Vec<Axes>> {
    match grid.len() {
        1 => Ok(vec![rearrange_1d(grid, max_grid)?]),
        2 => rearrange_2d(grid, max_grid),
        3 => rearrange_3d(grid, max_grid),
        _ => Err(crate::errors::ErrorKind::InvalidLaunchGeometry(
            "virtual sizes are supported for 1D to 3D grids only".into(),
        )
        .into()),
    }
}

fn rearrange_2d(grid: &[usize], max_grid: &[usize]) -> Result<Vec<Axes>> {
    let grid1 = rearrange_1d(&grid[..1], max_grid)?;

    let new_max_grid: Vec<usize> = max_grid.iter().zip(grid1.iter()).map(|(&mg, &g1)| mg / g1).collect();

    let grid2 = if product(&new_max_grid[1..]) >= grid[1] {
        let mut row = rearrange_1d(&grid[1..2], &new_max_grid[1..])?;
        row.insert(0, 1);
        row
    } else {
        rearrange_1d(&grid[1..2], &new_max_grid)?
    };

    Ok(vec![grid1, grid2])
}

fn rearrange_3d(grid: &[usize], max_grid: &[usize]) -> Result<Vec<Axes>> {
    let grid12 = rearrange_2d(&grid[..2], max_grid)?;
    let grid1 = &grid12[0];
    let grid2 = &grid12[1];

    let new_max_grid: Vec<usize> =
        max_grid.iter().zip(grid1.iter()).zip(grid2.iter()).map(|((&mg, &g1), &g2)| mg / g1 / g2).collect();

    let grid3 = if new_max_grid.len() > 2 && product(&new_max_grid[2..]) >= grid[2] {
        let mut row = rearrange_1d(&grid[2..3], &new_max_grid[2..])?;
        row.insert(0, 1);
        row.insert(0, 1);
        row
    } else if new_max_grid.len() > 1 && product(&new_max_grid[1..]) >= grid[2] {
        let mut row = rearrange_1d(&grid[2..3], &new_max_grid[1..])?;
        row.insert(0, 1);
        row
    } else {
        rearrange_1d(&grid[2..3], &new_max_grid)?
    };

    Ok(vec![grid1.clone(), grid2.clone(), grid3])
}

/// The core 1D rearrangement recursion. Deviates from `vsize.py` in one
/// place (SPEC_FULL.md §9 Open Question 2): the original only guards
/// `max_grid[0] == 0`, but a zero *anywhere else* in `max_grid` reaches the
/// same unusable state a few frames further down (dividing by an empty
/// product, or taking `log2` of zero) — so the guard here fires on any
/// zero in the vector, not only the leading one.
fn rearrange_1d(grid: &[usize], max_grid: &[usize]) -> Result<Axes> {
    let g = grid[0];

    if max_grid.is_empty() {
        return Err(crate::errors::ErrorKind::InvalidFactoring(max_grid.len(), g).into());
    }

    if g <= max_grid[0] {
        let mut row: Axes = smallvec![g];
        row.extend(std::iter::repeat(1).take(max_grid.len() - 1));
        return Ok(row);
    }

    if max_grid.iter().any(|&x| x == 0) {
        let mut row: Axes = smallvec![1];
        row.extend(rearrange_1d(&[g], &max_grid[1..])?);
        return Ok(row);
    }

    let fs = factors(g);
    let (mut f, mut div) = (1usize, g);
    for &(candidate_f, candidate_div) in fs.iter().rev() {
        f = candidate_f;
        div = candidate_div;
        if f <= max_grid[0] {
            break;
        }
    }

    if f != 1 && div <= product(&max_grid[1..]) {
        let res = rearrange_1d(&[div], &max_grid[1..])?;
        let mut row: Axes = smallvec![f];
        row.extend(res);
        return Ok(row);
    }

    let last = *max_grid.last().expect("max_grid is non-empty");
    if last >= 2 {
        for p in 1..=log2(last) {
            let f = 1usize << p;
            let remainder = min_blocks(g, f);
            if remainder <= product(&max_grid[..max_grid.len() - 1]) {
                let mut res = rearrange_1d(&[remainder], &max_grid[..max_grid.len() - 1])?;
                res.push(f);
                return Ok(res);
            }
        }
    }

    warn!(
        "no exact factoring found for grid dimension {} against max {:?}; \
         falling back to the device's own axis limit, which overshoots the requested size",
        g, max_grid
    );
    let f = max_grid[0];
    let remainder = min_blocks(g, f);
    let res = rearrange_1d(&[remainder], &max_grid[1..])?;
    let mut row: Axes = smallvec![f];
    row.extend(res);
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_work_group_size: usize, max_grid_sizes: &[usize]) -> DeviceParams {
        DeviceParams {
            max_work_group_size,
            max_grid_sizes: max_grid_sizes.iter().copied().collect(),
        }
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let err = VirtualSizeMapper::new(params(1024, &[65535, 65535]), &[16, 16], &[4]);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_more_than_three_dimensions() {
        let err = VirtualSizeMapper::new(params(1024, &[65535, 65535, 65535]), &[2, 2, 2, 2], &[1, 1, 1, 1]);
        assert!(err.is_err());
    }

    #[test]
    fn one_d_grid_fits_directly_when_under_the_device_limit() {
        let vs = VirtualSizeMapper::new(params(1024, &[65535]), &[1024], &[256]).unwrap();
        let (global, local) = vs.get_call_sizes();
        assert_eq!(&local[..], &[256]);
        assert_eq!(&global[..], &[1024]);
    }

    #[test]
    fn one_d_grid_spills_into_a_second_axis_when_it_overflows_the_first() {
        // bounding grid of 100_000 work groups against a device whose first
        // grid axis only goes up to 1_000: must factor across two axes.
        let vs = VirtualSizeMapper::new(params(1024, &[1_000, 1_000]), &[100_000 * 256], &[256]).unwrap();
        let (global, _local) = vs.get_call_sizes();
        // total work-items must still cover the requested global size
        assert!(global.iter().product::<usize>() >= 100_000 * 256);
    }

    #[test]
    fn one_d_grid_spilling_to_second_axis_matches_the_worked_example() {
        // global=(100_000_000,), local=(256,), max_grid=(65535,65535,1),
        // max_work_group_size=256. Bounding grid 390625 = 5^8; exact
        // factoring must pick the largest factor <= 65535, which is 15625
        // (390625 / 25), not 625 (390625's largest divisor <= sqrt(390625)).
        let vs = VirtualSizeMapper::new(params(256, &[65535, 65535, 1]), &[100_000_000], &[256]).unwrap();
        assert_eq!(&vs.grid_parts[0][..], &[15625, 25, 1]);
        let (global, local) = vs.get_call_sizes();
        assert_eq!(&global[..], &[15625 * 256, 25, 1]);
        assert_eq!(&local[..], &[256, 1, 1]);
    }

    #[test]
    fn rearrange_1d_any_zero_axis_is_treated_as_saturated() {
        // a zero in a non-leading position must not reach the factoring
        // math (which would divide by an empty product or take log2(0)).
        let row = rearrange_1d(&[10], &[1, 0, 8]).unwrap();
        assert_eq!(row[0], 1);
    }
}
