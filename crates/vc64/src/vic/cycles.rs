//! Per-cycle VIC-II behaviour tables.
//!
//! Each chip revision gets a precomputed dispatch table indexed by raster
//! cycle (1-based). Every entry is one distinct per-cycle routine: sprite
//! pointer/data fetches at the line edges, the video-matrix and graphics
//! accesses through the visible window, and the row-counter bookkeeping
//! at cycle 58. The table keeps the per-cycle dispatch out of a hot-path
//! switch and makes the PAL/NTSC differences pure data.

use super::Vic;
use crate::config::C64Model;
use crate::memory::Memory;

/// One cycle's worth of VIC behaviour.
pub type CycleFn = fn(&mut Vic, &Memory);

/// Build the dispatch table for a model. Index 0 is unused; entries
/// 1..=cycles_per_rasterline are valid.
pub fn build_cycle_table(model: C64Model) -> Vec<CycleFn> {
    let cycles = model.cycles_per_rasterline() as usize;
    let mut table: Vec<CycleFn> = vec![cycle_idle; cycles + 1];

    // Sprite pointer + data fetches. Sprites 0-2 are fetched at the tail
    // of the previous line, sprites 3-7 at the head of the current one.
    // The tail cycles shift right on the longer NTSC lines.
    let tail = cycles - 5; // 58 on PAL, 59/60 on NTSC
    table[tail] = fetch_sprite::<0>;
    table[tail + 2] = fetch_sprite::<1>;
    table[tail + 4] = fetch_sprite::<2>;
    table[1] = fetch_sprite::<3>;
    table[3] = fetch_sprite::<4>;
    table[5] = fetch_sprite::<5>;
    table[7] = fetch_sprite::<6>;
    table[9] = fetch_sprite::<7>;

    // Visible border-only cycles on the left edge.
    for cycle in 11..=13 {
        table[cycle] = cycle_border;
    }

    // Cycle 14: load VC from VCBASE, reset the row counter on badlines.
    table[14] = cycle_load_vc;

    // Cycle 15: first BA cycle of a badline; still border on screen.
    table[15] = cycle_border;

    // Cycles 16-55: c-access + g-access + pixel emission, one column per
    // cycle.
    for cycle in 16..=55 {
        table[cycle] = cycle_visible_column;
    }

    // Right border until the end of the visible region.
    for cycle in 56..=(cycles.min(62)) {
        if table[cycle] as usize == cycle_idle as usize {
            table[cycle] = cycle_border;
        }
    }

    // Cycle 58 also runs the row-counter logic. On PAL it shares the
    // slot with the sprite 0 fetch.
    if table[58] as usize == fetch_sprite::<0> as usize {
        table[58] = cycle_row_counter_and_sprite0;
    } else {
        table[58] = cycle_row_counter;
    }

    table
}

fn cycle_idle(_vic: &mut Vic, _mem: &Memory) {}

fn cycle_border(vic: &mut Vic, _mem: &Memory) {
    vic.emit_border_cycle();
}

fn cycle_load_vc(vic: &mut Vic, _mem: &Memory) {
    vic.load_vc();
    vic.emit_border_cycle();
}

fn cycle_visible_column(vic: &mut Vic, mem: &Memory) {
    vic.emit_display_cycle(mem);
}

fn cycle_row_counter(vic: &mut Vic, _mem: &Memory) {
    vic.update_row_counter();
    vic.emit_border_cycle();
}

fn cycle_row_counter_and_sprite0(vic: &mut Vic, mem: &Memory) {
    vic.update_row_counter();
    vic.fetch_sprite_line(0, mem);
    vic.emit_border_cycle();
}

fn fetch_sprite<const N: usize>(vic: &mut Vic, mem: &Memory) {
    vic.fetch_sprite_line(N, mem);
    vic.emit_border_cycle();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pal_table_length() {
        let table = build_cycle_table(C64Model::Pal6569R3);
        assert_eq!(table.len(), 64); // entries 1..=63
    }

    #[test]
    fn ntsc_tables_are_longer() {
        assert_eq!(build_cycle_table(C64Model::Ntsc6567R56A).len(), 65);
        assert_eq!(build_cycle_table(C64Model::Ntsc6567).len(), 66);
    }

    #[test]
    fn visible_window_dispatches_display() {
        let table = build_cycle_table(C64Model::Pal6569R3);
        for cycle in 16..=55 {
            assert_eq!(
                table[cycle] as usize, cycle_visible_column as usize,
                "cycle {cycle}"
            );
        }
    }

    #[test]
    fn sprite_fetches_claim_edge_cycles() {
        let table = build_cycle_table(C64Model::Pal6569R3);
        // On PAL the sprite 0 fetch shares cycle 58 with the row counter.
        assert_eq!(table[58] as usize, cycle_row_counter_and_sprite0 as usize);
        assert_eq!(table[60] as usize, fetch_sprite::<1> as usize);
        assert_eq!(table[1] as usize, fetch_sprite::<3> as usize);
        assert_eq!(table[9] as usize, fetch_sprite::<7> as usize);
    }

    #[test]
    fn ntsc_row_counter_does_not_displace_sprite0() {
        let table = build_cycle_table(C64Model::Ntsc6567);
        assert_eq!(table[58] as usize, cycle_row_counter as usize);
        assert_eq!(table[60] as usize, fetch_sprite::<0> as usize);
    }
}
